//! Shared fixtures: an in-memory store, a mapped business and a wiremock
//! CRM.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use tally_db::{Database, DbConfig, NewCustomer};
use tally_sync::{Claims, CrmClient, CrmSettings, ProcessorSettings, SyncProcessor};
use wiremock::MockServer;

pub const SECRET: &str = "shared-integration-secret";
pub const TENANT: &str = "crm-tenant-1";

pub struct Harness {
    pub db: Database,
    pub crm_server: MockServer,
    pub crm: CrmClient,
    pub business_id: String,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let business = db
            .businesses()
            .insert("Corner Shop", Some(TENANT))
            .await
            .unwrap();

        let crm_server = MockServer::start().await;
        let settings = CrmSettings {
            base_url: crm_server.uri(),
            integration_secret: SECRET.to_string(),
            ..Default::default()
        };
        let crm = CrmClient::new(&settings, db.clone()).unwrap();

        Harness {
            db,
            crm_server,
            crm,
            business_id: business.id,
        }
    }

    pub fn processor(&self, settings: ProcessorSettings) -> SyncProcessor {
        SyncProcessor::new(self.db.clone(), self.crm.clone(), settings)
    }

    /// A named, never-synced customer.
    pub async fn customer(&self, first_name: &str) -> String {
        self.db
            .customers()
            .insert(&NewCustomer {
                email: Some(format!("{}@example.com", first_name.to_lowercase())),
                ..NewCustomer::new(&self.business_id, first_name, "Tester")
            })
            .await
            .unwrap()
            .id
    }

    /// A customer already known to the CRM under `remote_id`.
    pub async fn synced_customer(&self, first_name: &str, remote_id: &str, points: i64) -> String {
        self.db
            .customers()
            .insert(&NewCustomer {
                loyalty_points: points,
                external_id: Some(remote_id.to_string()),
                sync_state: tally_core::CustomerSyncState::Synced,
                ..NewCustomer::new(&self.business_id, first_name, "Tester")
            })
            .await
            .unwrap()
            .id
    }
}

/// Processor settings with no pacing delay.
pub fn fast_settings() -> ProcessorSettings {
    ProcessorSettings {
        item_delay_ms: 0,
        ..Default::default()
    }
}

/// A webhook token as the CRM would sign it, scoped to [`TENANT`].
pub fn webhook_token(issuer: &str, scope: &str, secret: &str) -> String {
    tenant_webhook_token(Some(TENANT), issuer, scope, secret)
}

/// A webhook token with an explicit (or no) tenant claim.
pub fn tenant_webhook_token(
    tenant: Option<&str>,
    issuer: &str,
    scope: &str,
    secret: &str,
) -> String {
    let now = Utc::now();
    let claims = Claims {
        iss: issuer.to_string(),
        sub: "crm-webhooks".to_string(),
        tenant_id: tenant.map(str::to_string),
        scope: scope.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(5)).timestamp(),
        jti: uuid::Uuid::new_v4().to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
