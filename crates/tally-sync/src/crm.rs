//! # CRM Adapter
//!
//! Everything that talks to the remote CRM: payload shaping, signing,
//! calling, interpreting results and persisting what a success means locally.
//!
//! ## Outbound Call
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     sync_entity(item)                                   │
//! │                                                                         │
//! │  1. Resolve tenant       businesses.crm_tenant_id ── None ──► FAILED   │
//! │                                                     (non-retryable)    │
//! │  2. Load entity          customer / transaction (+ items) / rental     │
//! │  3. Shape payload        money as "12.50", timestamps RFC 3339         │
//! │  4. Sign                 HS256, tenantId claim, 5 min expiry           │
//! │  5. POST /sync/{kind}    bounded timeout                               │
//! │        │                                                                │
//! │        ├── 2xx ──► persist synced flag (+ remote id for customers)     │
//! │        └── else ─► SyncError::Remote { status, retryable }             │
//! │  6. Append sync_logs row (success AND failure)                         │
//! │  7. On success, resolve the entity's earlier FAILED rows               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Read Path
//! `GET /customers/{remoteId}` feeds the reconciliation engine with the
//! CRM-side loyalty balance.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::TokenMinter;
use crate::config::CrmSettings;
use crate::error::{SyncError, SyncResult};
use tally_core::{
    Business, Customer, EntityType, Money, Rental, RentalItem, SyncDirection, SyncLogStatus,
    SyncOperation, Transaction, TransactionItem,
};
use tally_db::{Database, NewSyncLog};

/// Header carrying the CRM tenant id next to the bearer token.
pub const TENANT_HEADER: &str = "X-Tenant-ID";

/// Longest error body kept in the audit ledger and queue.
const MAX_ERROR_BODY: usize = 500;

// =============================================================================
// Wire Payloads
// =============================================================================

/// `POST /sync/customer` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPayload {
    pub tenant_id: String,
    /// The local id. The CRM echoes it back in `updated` webhooks.
    pub external_id: String,
    /// The remote id once known.
    pub crm_id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub loyalty_points: i64,
    pub loyalty_tier: Option<String>,
    pub total_spent: Money,
    pub visit_count: i64,
    pub marketing_opt_in: bool,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// `POST /sync/transaction` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    pub tenant_id: String,
    pub transaction_id: String,
    pub transaction_number: String,
    /// Remote id of the customer.
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub subtotal: Money,
    pub tax: Money,
    pub discount: Money,
    pub total: Money,
    pub currency: String,
    pub payment_method: String,
    pub points_earned: i64,
    pub points_redeemed: i64,
    pub status: String,
    pub notes: Option<String>,
    pub items: Vec<TransactionLinePayload>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLinePayload {
    pub product_id: String,
    pub product_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price: Money,
    pub discount: Money,
    pub tax: Money,
    pub total: Money,
}

/// `POST /sync/rental` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalPayload {
    pub tenant_id: String,
    pub rental_id: String,
    pub contract_number: String,
    /// Remote id of the customer.
    pub customer_id: Option<String>,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub deposit: Money,
    pub total: Money,
    pub items: Vec<RentalLinePayload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalLinePayload {
    pub product_id: String,
    pub product_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub daily_rate: Money,
}

pub fn customer_payload(crm_tenant_id: &str, customer: &Customer) -> CustomerPayload {
    CustomerPayload {
        tenant_id: crm_tenant_id.to_string(),
        external_id: customer.id.clone(),
        crm_id: customer.external_id.clone(),
        first_name: customer.first_name.clone(),
        last_name: customer.last_name.clone(),
        email: customer.email.clone(),
        phone: customer.phone.clone(),
        address: customer.address.clone(),
        city: customer.city.clone(),
        state: customer.state.clone(),
        postal_code: customer.postal_code.clone(),
        loyalty_points: customer.loyalty_points,
        loyalty_tier: customer.loyalty_tier.clone(),
        total_spent: customer.total_spent(),
        visit_count: customer.visit_count,
        marketing_opt_in: customer.marketing_opt_in,
        is_active: customer.is_active,
        updated_at: customer.updated_at,
    }
}

pub fn transaction_payload(
    crm_tenant_id: &str,
    txn: &Transaction,
    items: &[TransactionItem],
    customer: Option<&Customer>,
) -> TransactionPayload {
    TransactionPayload {
        tenant_id: crm_tenant_id.to_string(),
        transaction_id: txn.id.clone(),
        transaction_number: txn.transaction_number.clone(),
        customer_id: customer.and_then(|c| c.external_id.clone()),
        customer_email: customer.and_then(|c| c.email.clone()),
        subtotal: Money::from_cents(txn.subtotal_cents),
        tax: Money::from_cents(txn.tax_cents),
        discount: Money::from_cents(txn.discount_cents),
        total: Money::from_cents(txn.total_cents),
        currency: txn.currency.clone(),
        payment_method: txn.payment_method.clone(),
        points_earned: txn.points_earned,
        points_redeemed: txn.points_redeemed,
        status: txn.status.clone(),
        notes: txn.notes.clone(),
        items: items
            .iter()
            .map(|i| TransactionLinePayload {
                product_id: i.product_id.clone(),
                product_name: i.product_name.clone(),
                sku: i.sku.clone(),
                quantity: i.quantity,
                unit_price: Money::from_cents(i.unit_price_cents),
                discount: Money::from_cents(i.discount_cents),
                tax: Money::from_cents(i.tax_cents),
                total: Money::from_cents(i.total_cents),
            })
            .collect(),
        timestamp: txn.created_at,
    }
}

pub fn rental_payload(
    crm_tenant_id: &str,
    rental: &Rental,
    items: &[RentalItem],
    customer: Option<&Customer>,
) -> RentalPayload {
    RentalPayload {
        tenant_id: crm_tenant_id.to_string(),
        rental_id: rental.id.clone(),
        contract_number: rental.contract_number.clone(),
        customer_id: customer.and_then(|c| c.external_id.clone()),
        status: rental.status.clone(),
        start_date: rental.start_date,
        due_date: rental.due_date,
        returned_at: rental.returned_at,
        deposit: Money::from_cents(rental.deposit_cents),
        total: Money::from_cents(rental.total_cents),
        items: items
            .iter()
            .map(|i| RentalLinePayload {
                product_id: i.product_id.clone(),
                product_name: i.product_name.clone(),
                sku: i.sku.clone(),
                quantity: i.quantity,
                daily_rate: Money::from_cents(i.daily_rate_cents),
            })
            .collect(),
    }
}

// =============================================================================
// Results
// =============================================================================

/// A 2xx answer from the CRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAck {
    pub http_status: u16,
    /// Remote id from `{ customer: { id } }` or `{ id }`, if any.
    pub remote_id: Option<String>,
}

/// The parts of a remote customer the engine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCustomer {
    pub id: Option<String>,
    pub loyalty_points: i64,
}

/// Pulls a remote id out of a sync response body.
fn remote_id_from(body: &Value) -> Option<String> {
    ["/customer/id", "/data/customer/id", "/id"]
        .iter()
        .filter_map(|p| body.pointer(p))
        .find_map(id_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads a remote customer, accepting `{ customer: {...} }` wrapping and
/// both `loyaltyPoints` and `loyalty_points`.
fn parse_remote_customer(body: &Value) -> SyncResult<RemoteCustomer> {
    let record = body.get("customer").unwrap_or(body);

    let points = record
        .get("loyaltyPoints")
        .or_else(|| record.get("loyalty_points"))
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .ok_or_else(|| {
            SyncError::Validation("CRM customer record has no loyalty balance".into())
        })?;
    if points < 0 {
        return Err(SyncError::Validation(format!(
            "CRM loyalty balance is negative: {points}"
        )));
    }

    Ok(RemoteCustomer {
        id: record.get("id").and_then(id_string),
        loyalty_points: points,
    })
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the CRM integration API.
#[derive(Debug, Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    base: url::Url,
    minter: TokenMinter,
    db: Database,
}

impl CrmClient {
    /// Builds a client with the configured timeout.
    pub fn new(settings: &CrmSettings, db: Database) -> SyncResult<Self> {
        let base = url::Url::parse(&settings.base_url)?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidConfig(format!(
                "CRM base URL cannot carry a path: {}",
                settings.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(CrmClient {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            base,
            minter: TokenMinter::from_settings(settings),
            db,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}/customers/{remote_id}` with the id as one escaped segment.
    fn customer_url(&self, remote_id: &str) -> SyncResult<url::Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidConfig("CRM base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push("customers")
            .push(remote_id);
        Ok(url)
    }

    fn headers(&self, crm_tenant_id: &str) -> SyncResult<HeaderMap> {
        let token = self.minter.mint(crm_tenant_id)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::Token(e.to_string()))?,
        );
        headers.insert(
            TENANT_HEADER,
            HeaderValue::from_str(crm_tenant_id)
                .map_err(|e| SyncError::Validation(format!("tenant id: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Resolves a business and its CRM tenant id.
    ///
    /// ## Errors
    /// `EntityNotFound` for an unknown business, `TenantUnmapped` when the
    /// business has no CRM tenant. Neither is retryable.
    pub async fn resolve_tenant(&self, business_id: &str) -> SyncResult<(Business, String)> {
        let business = self
            .db
            .businesses()
            .get(business_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Business", business_id))?;

        match business.crm_tenant_id.clone() {
            Some(tenant) => Ok((business, tenant)),
            None => Err(SyncError::TenantUnmapped {
                business_id: business_id.to_string(),
            }),
        }
    }

    /// Signs and POSTs a JSON body. Non-2xx becomes `SyncError::Remote`.
    async fn post_json(&self, path: &str, crm_tenant_id: &str, body: &Value) -> SyncResult<SyncAck> {
        let response = self
            .http
            .post(self.url(path))
            .headers(self.headers(crm_tenant_id)?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(SyncError::remote(status.as_u16(), truncate(&text)));
        }

        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok(SyncAck {
            http_status: status.as_u16(),
            remote_id: remote_id_from(&parsed),
        })
    }

    /// Appends an outbound audit row. A ledger failure never masks the
    /// outcome of the call itself.
    async fn record(
        &self,
        business_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        operation: SyncOperation,
        payload: Option<&Value>,
        result: &SyncResult<SyncAck>,
    ) {
        let (status, error_message, http_status) = match result {
            Ok(ack) => (SyncLogStatus::Success, None, Some(ack.http_status as i64)),
            Err(e) => (
                SyncLogStatus::Failed,
                Some(e.to_string()),
                e.http_status().map(i64::from),
            ),
        };

        let entry = NewSyncLog {
            business_id: business_id.to_string(),
            direction: SyncDirection::Outbound,
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            status,
            payload: payload.map(Value::to_string),
            error_message,
            http_status,
        };

        if let Err(e) = self.db.sync_logs().insert(&entry).await {
            warn!(error = %e, entity_id = %entity_id, "Failed to write sync log");
        }
    }

    // =========================================================================
    // Outbound Sync
    // =========================================================================

    /// Sends one entity to the CRM, persists the local consequences and
    /// appends a ledger row.
    pub async fn sync_entity(
        &self,
        business_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        operation: SyncOperation,
    ) -> SyncResult<SyncAck> {
        let (payload, result) = self.send(business_id, entity_type, entity_id).await;
        self.record(
            business_id,
            entity_type,
            entity_id,
            operation,
            payload.as_ref(),
            &result,
        )
        .await;

        if let Ok(ack) = &result {
            info!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                remote_id = ?ack.remote_id,
                "Synced to CRM"
            );
            if let Err(e) = self
                .db
                .sync_logs()
                .resolve_failures(entity_type, entity_id, Utc::now())
                .await
            {
                warn!(error = %e, entity_id = %entity_id, "Failed to resolve earlier sync failures");
            }
        }
        result
    }

    /// Same as [`sync_entity`](Self::sync_entity) without a new ledger row.
    /// The sync log retry job tracks its attempts on the original row.
    pub async fn resend_entity(
        &self,
        business_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> SyncResult<SyncAck> {
        self.send(business_id, entity_type, entity_id).await.1
    }

    /// `POST /sync/customer`, stores the remote id from the response.
    pub async fn sync_customer(
        &self,
        business_id: &str,
        customer_id: &str,
        operation: SyncOperation,
    ) -> SyncResult<SyncAck> {
        self.sync_entity(business_id, EntityType::Customer, customer_id, operation)
            .await
    }

    /// Returns the body that was sent (if one was built) with the outcome.
    async fn send(
        &self,
        business_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> (Option<Value>, SyncResult<SyncAck>) {
        let mut payload = None;
        let result = match entity_type {
            EntityType::Customer => self.send_customer(business_id, entity_id, &mut payload).await,
            EntityType::Transaction => {
                self.send_transaction(business_id, entity_id, &mut payload)
                    .await
            }
            EntityType::Rental => self.send_rental(business_id, entity_id, &mut payload).await,
            EntityType::Product => Err(SyncError::Validation(
                "products have no CRM endpoint".into(),
            )),
        };
        (payload, result)
    }

    async fn send_customer(
        &self,
        business_id: &str,
        customer_id: &str,
        payload: &mut Option<Value>,
    ) -> SyncResult<SyncAck> {
        let (_, tenant) = self.resolve_tenant(business_id).await?;
        let customer = self
            .db
            .customers()
            .get(customer_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Customer", customer_id))?;

        let body = serde_json::to_value(customer_payload(&tenant, &customer))?;
        let ack = self
            .post_json("/sync/customer", &tenant, payload.insert(body))
            .await?;

        self.db
            .customers()
            .mark_synced(customer_id, ack.remote_id.as_deref(), Utc::now())
            .await?;
        Ok(ack)
    }

    async fn send_transaction(
        &self,
        business_id: &str,
        transaction_id: &str,
        payload: &mut Option<Value>,
    ) -> SyncResult<SyncAck> {
        let (_, tenant) = self.resolve_tenant(business_id).await?;
        let txn = self
            .db
            .transactions()
            .get(transaction_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Transaction", transaction_id))?;
        let items = self.db.transactions().items(transaction_id).await?;
        let customer = match &txn.customer_id {
            Some(id) => self.db.customers().get(id).await?,
            None => None,
        };

        let body = serde_json::to_value(transaction_payload(
            &tenant,
            &txn,
            &items,
            customer.as_ref(),
        ))?;
        let ack = self
            .post_json("/sync/transaction", &tenant, payload.insert(body))
            .await?;

        self.db
            .transactions()
            .mark_synced(transaction_id, Utc::now())
            .await?;
        Ok(ack)
    }

    async fn send_rental(
        &self,
        business_id: &str,
        rental_id: &str,
        payload: &mut Option<Value>,
    ) -> SyncResult<SyncAck> {
        let (_, tenant) = self.resolve_tenant(business_id).await?;
        let rental = self
            .db
            .rentals()
            .get(rental_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Rental", rental_id))?;
        let items = self.db.rentals().items(rental_id).await?;
        let customer = match &rental.customer_id {
            Some(id) => self.db.customers().get(id).await?,
            None => None,
        };

        let body = serde_json::to_value(rental_payload(
            &tenant,
            &rental,
            &items,
            customer.as_ref(),
        ))?;
        let ack = self
            .post_json("/sync/rental", &tenant, payload.insert(body))
            .await?;

        self.db.rentals().mark_synced(rental_id, Utc::now()).await?;
        Ok(ack)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// `GET /customers/{remoteId}`.
    ///
    /// ## Errors
    /// A 404 is a non-retryable `Remote` error. A body without a loyalty
    /// balance is a `Validation` error.
    pub async fn fetch_customer(
        &self,
        crm_tenant_id: &str,
        remote_id: &str,
    ) -> SyncResult<RemoteCustomer> {
        let response = self
            .http
            .get(self.customer_url(remote_id)?)
            .headers(self.headers(crm_tenant_id)?)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::remote(status.as_u16(), truncate(&text)));
        }

        let body: Value = serde_json::from_str(&text)?;
        let remote = parse_remote_customer(&body)?;
        debug!(remote_id = %remote_id, points = remote.loyalty_points, "Fetched CRM customer");
        Ok(remote)
    }

    /// `GET /health`. True on any 2xx.
    pub async fn health_check(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "CRM health check failed");
                false
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
