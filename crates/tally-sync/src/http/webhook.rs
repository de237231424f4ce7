//! # Customer Webhook Receiver
//!
//! `POST /webhooks/customer`: the CRM pushing customer changes back to the
//! POS.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Authorization: Bearer <jwt> ── verify sig, exp, iss, scope ── ✗ ► 401  │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  body ── not JSON / bad field ────────────────────────────────────► 400 │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  tenant = body.tenantId ?? claims.tenantId ── none ───────────────► 400 │
//! │        │                                   ── no business ────────► 404 │
//! │        ▼                                                                │
//! │  operation (default "updated")                                          │
//! │   created  remote id ► email ► phone ─┬─ found ► patch + remote id  200 │
//! │                                       └─ none ─► insert SYNCED      201 │
//! │   updated  local id (externalId | id) ─── none ► 404, else patch    200 │
//! │   deleted  remote id | local id ──────── deactivate (if present)    200 │
//! │   other  ─────────────────────────────────────────────────────────► 400 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Idempotency
//! A replayed `created` finds the row it made the first time by remote id.
//! Patches only overwrite the fields present, so replaying them converges.
//! `deleted` keeps the remote id on the row so a replay resolves to it.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::{classify, ApiError};
use crate::auth::{extract_bearer_token, Claims, WebhookVerifier};
use crate::error::{SyncError, SyncResult};
use tally_core::validation::{
    normalize_email, normalize_phone, require, validate_name, validate_non_negative,
};
use tally_core::{
    Business, Customer, CustomerSyncState, EntityType, Money, SyncDirection, SyncLogStatus,
    SyncOperation,
};
use tally_db::{CustomerPatch, Database, NewCustomer, NewSyncLog};

// =============================================================================
// State & Router
// =============================================================================

/// Shared state of the webhook router.
#[derive(Debug, Clone)]
pub struct WebhookState {
    pub db: Database,
    pub verifier: WebhookVerifier,
}

/// Builds the public webhook router.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/customer", post(customer_webhook))
        .with_state(state)
}

// =============================================================================
// Wire Types
// =============================================================================

/// What the CRM did to the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOperation {
    Created,
    Updated,
    Deleted,
}

impl WebhookOperation {
    /// Parses the `operation` field. Absent means `updated`.
    pub fn parse(value: Option<&str>) -> SyncResult<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("updated") => Ok(WebhookOperation::Updated),
            Some("created") => Ok(WebhookOperation::Created),
            Some("deleted") => Ok(WebhookOperation::Deleted),
            Some(other) => Err(SyncError::Validation(format!(
                "unknown operation '{other}'"
            ))),
        }
    }

    fn sync_operation(self) -> SyncOperation {
        match self {
            WebhookOperation::Created => SyncOperation::Create,
            WebhookOperation::Updated => SyncOperation::Update,
            WebhookOperation::Deleted => SyncOperation::Delete,
        }
    }
}

/// Body of `POST /webhooks/customer`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerWebhook {
    pub operation: Option<String>,
    /// Remote (CRM) id.
    #[serde(default, deserialize_with = "opt_id")]
    pub customer_id: Option<String>,
    /// Local id, echoed back from the first outbound sync.
    #[serde(default, deserialize_with = "opt_id")]
    pub external_id: Option<String>,
    /// Local id (legacy field name).
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub tenant_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub loyalty_points: Option<i64>,
    pub loyalty_tier: Option<String>,
    pub total_spent: Option<Value>,
    pub visit_count: Option<i64>,
    pub marketing_opt_in: Option<bool>,
    pub is_active: Option<bool>,
}

/// Accepts ids sent as strings or numbers.
fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Success body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub success: bool,
    pub action: String,
    pub customer_id: Option<String>,
}

impl WebhookResponse {
    fn new(action: &str, customer_id: Option<String>) -> Self {
        WebhookResponse {
            success: true,
            action: action.to_string(),
            customer_id,
        }
    }
}

impl CustomerWebhook {
    /// The local id, from `externalId` or `id`.
    fn local_id(&self) -> Option<&str> {
        self.external_id.as_deref().or(self.id.as_deref())
    }

    /// Validates the present fields into a patch. The remote id is carried
    /// as the new `external_id`.
    fn to_patch(&self) -> SyncResult<CustomerPatch> {
        let total_spent_cents = match &self.total_spent {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(Money::parse_decimal(s)?.cents()),
            Some(Value::Number(n)) => Some(Money::parse_decimal(&n.to_string())?.cents()),
            Some(_) => {
                return Err(SyncError::Validation("totalSpent must be a decimal".into()));
            }
        };

        Ok(CustomerPatch {
            first_name: self
                .first_name
                .as_deref()
                .map(|v| validate_name("firstName", v))
                .transpose()?,
            last_name: self
                .last_name
                .as_deref()
                .map(|v| validate_name("lastName", v))
                .transpose()?,
            email: non_blank(&self.email).map(normalize_email).transpose()?,
            phone: non_blank(&self.phone).map(normalize_phone).transpose()?,
            address: self.address.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            postal_code: self.postal_code.clone(),
            loyalty_points: self
                .loyalty_points
                .map(|v| validate_non_negative("loyaltyPoints", v))
                .transpose()?,
            loyalty_tier: self.loyalty_tier.clone(),
            total_spent_cents: total_spent_cents
                .map(|v| validate_non_negative("totalSpent", v))
                .transpose()?,
            visit_count: self
                .visit_count
                .map(|v| validate_non_negative("visitCount", v))
                .transpose()?,
            marketing_opt_in: self.marketing_opt_in,
            is_active: self.is_active,
            external_id: self.customer_id.clone(),
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

// =============================================================================
// Handler
// =============================================================================

async fn customer_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let claims = authenticate(&state.verifier, &headers)?;

    let payload: CustomerWebhook = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?;
    let operation = WebhookOperation::parse(payload.operation.as_deref())?;

    let tenant = webhook_tenant(payload.tenant_id.as_deref(), claims.tenant_id.as_deref())?;

    let business = state
        .db
        .businesses()
        .find_by_crm_tenant(&tenant)
        .await
        .map_err(SyncError::from)?
        .ok_or_else(|| ApiError::not_found(format!("no business for tenant {tenant}")))?;

    let receiver = Receiver {
        db: &state.db,
        business: &business,
    };

    let result = match operation {
        WebhookOperation::Created => receiver.created(&payload).await,
        WebhookOperation::Updated => receiver.updated(&payload).await,
        WebhookOperation::Deleted => receiver.deleted(&payload).await,
    };

    receiver.record(operation, &payload, &result).await;

    let (status, response) = result?;
    info!(
        business_id = %business.id,
        operation = ?operation,
        action = %response.action,
        customer_id = ?response.customer_id,
        "Customer webhook applied"
    );
    Ok((status, Json(response)))
}

/// The CRM tenant a webhook applies to. A body tenant must match the one the
/// token was issued for.
fn webhook_tenant(body: Option<&str>, claim: Option<&str>) -> Result<String, ApiError> {
    match (body, claim) {
        (Some(body), Some(claim)) if body != claim => {
            warn!(body_tenant = %body, token_tenant = %claim, "Webhook tenant mismatch");
            Err(ApiError::unauthorized("token is not valid for this tenant"))
        }
        (Some(tenant), _) | (None, Some(tenant)) => Ok(tenant.to_string()),
        (None, None) => Err(ApiError::bad_request("tenantId is required")),
    }
}

/// Any failure is a 401 with no detail.
fn authenticate(verifier: &WebhookVerifier, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    verifier.verify(token).map_err(|e| {
        warn!(error = %e, "Webhook token rejected");
        ApiError::unauthorized("invalid token")
    })
}

// =============================================================================
// Operations
// =============================================================================

type Applied = (StatusCode, WebhookResponse);

struct Receiver<'a> {
    db: &'a Database,
    business: &'a Business,
}

impl Receiver<'_> {
    async fn created(&self, payload: &CustomerWebhook) -> SyncResult<Applied> {
        let remote_id = require("customerId", payload.customer_id.as_deref())?;
        let patch = payload.to_patch()?;

        if let Some(existing) = self.find_for_create(remote_id, &patch).await? {
            return self.patch_existing(&existing, &patch).await;
        }

        let first_name = patch
            .first_name
            .clone()
            .ok_or_else(|| SyncError::Validation("firstName is required".into()))?;
        let last_name = patch.last_name.clone().unwrap_or_default();

        let new = NewCustomer {
            email: patch.email.clone(),
            phone: patch.phone.clone(),
            address: patch.address.clone(),
            city: patch.city.clone(),
            state: patch.state.clone(),
            postal_code: patch.postal_code.clone(),
            loyalty_points: patch.loyalty_points.unwrap_or(0),
            loyalty_tier: patch.loyalty_tier.clone(),
            total_spent_cents: patch.total_spent_cents.unwrap_or(0),
            visit_count: patch.visit_count.unwrap_or(0),
            marketing_opt_in: patch.marketing_opt_in.unwrap_or(false),
            external_id: Some(remote_id.to_string()),
            sync_state: CustomerSyncState::Synced,
            ..NewCustomer::new(&self.business.id, first_name, last_name)
        };

        match self.db.customers().insert(&new).await {
            Ok(customer) => {
                debug!(customer_id = %customer.id, remote_id, "Customer created from CRM");
                Ok((
                    StatusCode::CREATED,
                    WebhookResponse::new("created", Some(customer.id)),
                ))
            }
            // A concurrent delivery of the same event inserted first.
            Err(tally_db::DbError::UniqueViolation { .. }) => {
                let existing = self
                    .db
                    .customers()
                    .find_by_external_id(&self.business.id, remote_id)
                    .await?
                    .ok_or_else(|| SyncError::Duplicate(format!("customer {remote_id}")))?;
                self.patch_existing(&existing, &patch).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_for_create(
        &self,
        remote_id: &str,
        patch: &CustomerPatch,
    ) -> SyncResult<Option<Customer>> {
        let customers = self.db.customers();
        if let Some(found) = customers
            .find_by_external_id(&self.business.id, remote_id)
            .await?
        {
            return Ok(Some(found));
        }
        Ok(customers
            .find_by_contact(
                &self.business.id,
                patch.email.as_deref(),
                patch.phone.as_deref(),
            )
            .await?)
    }

    async fn patch_existing(&self, existing: &Customer, patch: &CustomerPatch) -> SyncResult<Applied> {
        self.db
            .customers()
            .apply_patch(&existing.id, patch, Utc::now())
            .await?;
        Ok((
            StatusCode::OK,
            WebhookResponse::new("updated", Some(existing.id.clone())),
        ))
    }

    async fn updated(&self, payload: &CustomerWebhook) -> SyncResult<Applied> {
        let local_id = require("externalId", payload.local_id())?;
        let patch = payload.to_patch()?;

        let existing = self
            .db
            .customers()
            .get(local_id)
            .await?
            .filter(|c| c.business_id == self.business.id)
            .ok_or_else(|| SyncError::not_found("Customer", local_id))?;

        self.patch_existing(&existing, &patch).await
    }

    async fn deleted(&self, payload: &CustomerWebhook) -> SyncResult<Applied> {
        let customers = self.db.customers();

        let mut existing = None;
        if let Some(remote_id) = payload.customer_id.as_deref() {
            existing = customers
                .find_by_external_id(&self.business.id, remote_id)
                .await?;
        }
        if existing.is_none() {
            if let Some(local_id) = payload.local_id() {
                existing = customers
                    .get(local_id)
                    .await?
                    .filter(|c| c.business_id == self.business.id);
            }
        }

        let Some(existing) = existing else {
            debug!(remote_id = ?payload.customer_id, "Delete for unknown customer ignored");
            return Ok((StatusCode::OK, WebhookResponse::new("not_found", None)));
        };

        let action = if customers.deactivate(&existing.id, Utc::now()).await? {
            "deactivated"
        } else {
            "unchanged"
        };
        Ok((StatusCode::OK, WebhookResponse::new(action, Some(existing.id))))
    }

    /// Appends an inbound ledger row. Never fails the request.
    async fn record(
        &self,
        operation: WebhookOperation,
        payload: &CustomerWebhook,
        result: &SyncResult<Applied>,
    ) {
        let entity_id = match result {
            Ok((_, response)) => response.customer_id.clone(),
            Err(_) => None,
        }
        .or_else(|| payload.local_id().map(str::to_string))
        .or_else(|| payload.customer_id.clone())
        .unwrap_or_default();

        let (status, error_message) = match result {
            Ok(_) => (SyncLogStatus::Success, None),
            Err(e) => (SyncLogStatus::Failed, Some(e.to_string())),
        };

        let entry = NewSyncLog {
            business_id: self.business.id.clone(),
            direction: SyncDirection::Inbound,
            entity_type: EntityType::Customer,
            entity_id,
            operation: operation.sync_operation(),
            status,
            payload: None,
            error_message,
            http_status: Some(match result {
                Ok((code, _)) => code.as_u16() as i64,
                Err(e) => classify(e).0.as_u16() as i64,
            }),
        };

        if let Err(e) = self.db.sync_logs().insert(&entry).await {
            warn!(error = %e, "Failed to write inbound sync log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parsing() {
        assert_eq!(WebhookOperation::parse(None).unwrap(), WebhookOperation::Updated);
        assert_eq!(
            WebhookOperation::parse(Some("CREATED")).unwrap(),
            WebhookOperation::Created
        );
        assert_eq!(
            WebhookOperation::parse(Some("deleted")).unwrap(),
            WebhookOperation::Deleted
        );
        assert!(WebhookOperation::parse(Some("merged")).is_err());
    }

    #[test]
    fn test_webhook_tenant_resolution() {
        assert_eq!(webhook_tenant(Some("t-1"), None).unwrap(), "t-1");
        assert_eq!(webhook_tenant(None, Some("t-1")).unwrap(), "t-1");
        assert_eq!(webhook_tenant(Some("t-1"), Some("t-1")).unwrap(), "t-1");

        let mismatch = webhook_tenant(Some("t-2"), Some("t-1")).unwrap_err();
        assert_eq!(mismatch.status, StatusCode::UNAUTHORIZED);

        let missing = webhook_tenant(None, None).unwrap_err();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_numeric_ids_and_decimal_money() {
        let payload: CustomerWebhook = serde_json::from_value(serde_json::json!({
            "customerId": 42,
            "externalId": "local-1",
            "totalSpent": "12.5",
            "email": "  Ada@Example.COM ",
            "phone": ""
        }))
        .unwrap();

        assert_eq!(payload.customer_id.as_deref(), Some("42"));
        assert_eq!(payload.local_id(), Some("local-1"));

        let patch = payload.to_patch().unwrap();
        assert_eq!(patch.total_spent_cents, Some(1250));
        assert_eq!(patch.email.as_deref(), Some("ada@example.com"));
        assert_eq!(patch.phone, None);
        assert_eq!(patch.external_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_negative_points_rejected() {
        let payload = CustomerWebhook {
            loyalty_points: Some(-5),
            ..Default::default()
        };
        assert!(matches!(payload.to_patch(), Err(SyncError::Validation(_))));
    }
}
