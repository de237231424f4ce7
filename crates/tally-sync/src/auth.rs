//! # System-to-System Tokens
//!
//! HS256 JWTs in both directions, signed with the shared integration secret.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  OUTBOUND (TokenMinter)              INBOUND (WebhookVerifier)          │
//! │  ──────────────────────              ─────────────────────────          │
//! │  iss      = "tally-pos"              signature  must verify            │
//! │  sub      = "system-to-system"       exp        must be in the future  │
//! │  tenantId = CRM tenant id            iss        must equal "crm"       │
//! │  scope    = "integration"            scope      must include "webhook" │
//! │  exp      = now + 300s                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{CrmSettings, SyncConfig};
use crate::error::{SyncError, SyncResult};

/// Subject of every outbound token.
pub const SYSTEM_SUBJECT: &str = "system-to-system";

/// Scope of every outbound token.
pub const INTEGRATION_SCOPE: &str = "integration";

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    pub iss: String,

    /// Subject
    pub sub: String,

    /// CRM tenant the token is scoped to
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Space-separated scopes
    #[serde(default)]
    pub scope: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// JWT ID
    #[serde(default)]
    pub jti: String,
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Mints short-lived tokens for calls to the CRM.
#[derive(Clone)]
pub struct TokenMinter {
    secret: String,
    issuer: String,
    lifetime_secs: i64,
}

impl std::fmt::Debug for TokenMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMinter")
            .field("issuer", &self.issuer)
            .field("lifetime_secs", &self.lifetime_secs)
            .finish_non_exhaustive()
    }
}

impl TokenMinter {
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>, lifetime_secs: i64) -> Self {
        TokenMinter {
            secret: secret.into(),
            issuer: issuer.into(),
            lifetime_secs,
        }
    }

    pub fn from_settings(crm: &CrmSettings) -> Self {
        Self::new(
            crm.integration_secret.clone(),
            crm.token_issuer.clone(),
            crm.token_ttl_secs as i64,
        )
    }

    /// Mints a token scoped to one CRM tenant.
    pub fn mint(&self, crm_tenant_id: &str) -> SyncResult<String> {
        let now = Utc::now();
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: SYSTEM_SUBJECT.to_string(),
            tenant_id: Some(crm_tenant_id.to_string()),
            scope: INTEGRATION_SCOPE.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.lifetime_secs)).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;
        Ok(token)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Verifies webhook tokens issued by the CRM.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    expected_issuer: String,
    required_scope: String,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("expected_issuer", &self.expected_issuer)
            .field("required_scope", &self.required_scope)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(
        secret: impl Into<String>,
        expected_issuer: impl Into<String>,
        required_scope: impl Into<String>,
    ) -> Self {
        WebhookVerifier {
            secret: secret.into(),
            expected_issuer: expected_issuer.into(),
            required_scope: required_scope.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.webhook_secret(),
            config.webhook.expected_issuer.clone(),
            config.webhook.required_scope.clone(),
        )
    }

    /// Validates signature, expiry, issuer and scope.
    pub fn verify(&self, token: &str) -> SyncResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.expected_issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )?;

        if !data.claims.has_scope(&self.required_scope) {
            return Err(SyncError::Token(format!(
                "missing required scope '{}'",
                self.required_scope
            )));
        }

        Ok(data.claims)
    }
}

/// Extract bearer token from authorization header.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
