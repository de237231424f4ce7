//! # Domain Types
//!
//! Core types shared by the queue store, the sync engine and the webhook
//! receiver.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  OUTBOUND WORK                      LOCAL ENTITIES                      │
//! │  ┌─────────────────┐               ┌─────────────────┐                 │
//! │  │ SyncQueueItem   │──entity_id──► │ Customer        │◄── remote id    │
//! │  │  entity_type    │               │ Transaction     │    (external_id)│
//! │  │  priority       │               │ Rental          │                 │
//! │  │  status         │               └─────────────────┘                 │
//! │  │  retry_count    │                                                   │
//! │  │  scheduled_for  │               TENANCY                             │
//! │  └─────────────────┘               ┌─────────────────┐                 │
//! │                                    │ Business        │◄── crm_tenant_id│
//! │  AUDIT                             └─────────────────┘                 │
//! │  ┌─────────────────┐  ┌──────────────────────────────┐                 │
//! │  │ SyncLogEntry    │  │ LoyaltyReconciliation        │                 │
//! │  └─────────────────┘  └──────────────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Every local entity has a UUID `id`. Syncable entities additionally carry
//! an optional `external_id`: the id the CRM assigned on first successful
//! sync. That pair is the upsert key in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::CoreError;
use crate::money::Money;

// =============================================================================
// Entity Type
// =============================================================================

/// The kind of local entity a queue item refers to.
///
/// The declaration order is the dependency order: customers must reach the
/// CRM before the transactions and rentals that reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Customer,
    Transaction,
    Rental,
    Product,
}

impl EntityType {
    /// Sort key for dispatch ordering (lower goes first).
    #[inline]
    pub const fn rank(self) -> i64 {
        match self {
            EntityType::Customer => 0,
            EntityType::Transaction => 1,
            EntityType::Rental => 2,
            EntityType::Product => 3,
        }
    }

    /// True when the entity may only be sent once its customer is synced.
    #[inline]
    pub const fn requires_customer(self) -> bool {
        matches!(self, EntityType::Transaction | EntityType::Rental)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Customer => "customer",
            EntityType::Transaction => "transaction",
            EntityType::Rental => "rental",
            EntityType::Product => "product",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(EntityType::Customer),
            "transaction" => Ok(EntityType::Transaction),
            "rental" => Ok(EntityType::Rental),
            "product" => Ok(EntityType::Product),
            other => Err(CoreError::unknown("entity type", other)),
        }
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// What happened to the local entity that caused it to be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Create => "CREATE",
            SyncOperation::Update => "UPDATE",
            SyncOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Processing tier of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl SyncPriority {
    /// Sort key for dispatch ordering (higher goes first).
    #[inline]
    pub const fn rank(self) -> i64 {
        match self {
            SyncPriority::High => 2,
            SyncPriority::Normal => 1,
            SyncPriority::Low => 0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SyncPriority::High => "HIGH",
            SyncPriority::Normal => "NORMAL",
            SyncPriority::Low => "LOW",
        }
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Queue Status
// =============================================================================

/// Lifecycle state of a queue item.
///
/// ```text
///  PENDING ──► PROCESSING ──► SUCCESS
///                  │  ▲
///                  │  └──────── RETRY (scheduled_for elapsed)
///                  ├──► RETRY
///                  └──► FAILED ──(manual bulk retry)──► PENDING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    Pending,
    Processing,
    Retry,
    Success,
    Failed,
}

impl QueueStatus {
    /// Non-terminal states. At most one active item may exist per entity.
    #[inline]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Processing | QueueStatus::Retry
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Processing => "PROCESSING",
            QueueStatus::Retry => "RETRY",
            QueueStatus::Success => "SUCCESS",
            QueueStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sync Queue Item
// =============================================================================

/// A unit of outbound sync work.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SyncQueueItem {
    pub id: String,
    pub business_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub priority: SyncPriority,
    pub status: QueueStatus,
    /// Failed attempts so far. Dependency waits never count.
    pub retry_count: i64,
    /// Earliest time the item may be picked up.
    #[ts(as = "String")]
    pub scheduled_for: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Optional JSON snapshot captured at enqueue time.
    pub payload: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Parameters for adding work to the queue.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub business_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub priority: SyncPriority,
    pub payload: Option<serde_json::Value>,
}

impl EnqueueRequest {
    /// Creates a NORMAL priority request with no payload snapshot.
    pub fn new(
        business_id: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: SyncOperation,
    ) -> Self {
        EnqueueRequest {
            business_id: business_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            priority: SyncPriority::Normal,
            payload: None,
        }
    }

    /// Sets the priority tier.
    pub fn priority(mut self, priority: SyncPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a payload snapshot.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Queue counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub retry: i64,
    pub failed: i64,
    pub success: i64,
    pub total: i64,
}

// =============================================================================
// Business (Tenant)
// =============================================================================

/// A local business. Maps 1:1 to a CRM tenant when `crm_tenant_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Business {
    pub id: String,
    pub name: String,
    pub crm_tenant_id: Option<String>,
    pub is_active: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Customer
// =============================================================================

/// Sync state of a customer relative to the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum CustomerSyncState {
    #[default]
    Pending,
    Synced,
    Failed,
}

/// A local customer record.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Customer {
    pub id: String,
    pub business_id: String,
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
    pub total_spent_cents: i64,
    pub visit_count: i64,
    pub marketing_opt_in: bool,
    /// Walk-in placeholder. Never synced, never reconciled.
    pub is_anonymous: bool,
    pub is_active: bool,
    /// Id assigned by the CRM after the first successful sync.
    pub external_id: Option<String>,
    pub sync_state: CustomerSyncState,
    #[ts(as = "Option<String>")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Confirmed present in the CRM: has a remote id and is marked SYNCED.
    pub fn is_synced(&self) -> bool {
        self.external_id.is_some() && self.sync_state == CustomerSyncState::Synced
    }

    pub fn total_spent(&self) -> Money {
        Money::from_cents(self.total_spent_cents)
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A completed sale as recorded by the POS.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Transaction {
    pub id: String,
    pub business_id: String,
    pub transaction_number: String,
    pub customer_id: Option<String>,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub payment_method: String,
    pub points_earned: i64,
    pub points_redeemed: i64,
    pub status: String,
    pub notes: Option<String>,
    pub synced_to_crm: bool,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// A line item of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct TransactionItem {
    pub id: String,
    pub transaction_id: String,
    pub product_id: String,
    pub product_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

// =============================================================================
// Rental
// =============================================================================

/// A rental contract.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Rental {
    pub id: String,
    pub business_id: String,
    pub contract_number: String,
    pub customer_id: Option<String>,
    pub status: String,
    #[ts(as = "String")]
    pub start_date: DateTime<Utc>,
    #[ts(as = "String")]
    pub due_date: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub returned_at: Option<DateTime<Utc>>,
    pub deposit_cents: i64,
    pub total_cents: i64,
    pub synced_to_crm: bool,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// A rented product line.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct RentalItem {
    pub id: String,
    pub rental_id: String,
    pub product_id: String,
    pub product_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub daily_rate_cents: i64,
}

// =============================================================================
// Sync Log
// =============================================================================

/// Direction of a logged sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncDirection {
    Outbound,
    Inbound,
}

/// Outcome of a logged sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncLogStatus {
    Success,
    Failed,
}

/// One row of the append-only sync audit ledger.
///
/// Only `attempt_count`, `next_retry_at`, `resolved_at` and `error_message`
/// change after insert, and only through the log retry job.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SyncLogEntry {
    pub id: String,
    pub business_id: String,
    pub direction: SyncDirection,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub status: SyncLogStatus,
    pub payload: Option<String>,
    pub error_message: Option<String>,
    pub http_status: Option<i64>,
    pub attempt_count: i64,
    #[ts(as = "Option<String>")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Loyalty Reconciliation
// =============================================================================

/// What the reconciliation engine did about a customer's point balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationAction {
    None,
    AutoSync,
    SyncWithLog,
    ManualReview,
    Failed,
}

impl ReconciliationAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReconciliationAction::None => "NONE",
            ReconciliationAction::AutoSync => "AUTO_SYNC",
            ReconciliationAction::SyncWithLog => "SYNC_WITH_LOG",
            ReconciliationAction::ManualReview => "MANUAL_REVIEW",
            ReconciliationAction::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state of a reconciliation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReconciliationStatus {
    Resolved,
    Pending,
    Failed,
}

/// Outcome of comparing one customer's local and remote balances.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct LoyaltyReconciliation {
    pub id: String,
    pub business_id: String,
    pub customer_id: String,
    pub pos_points: i64,
    pub crm_points: i64,
    /// `pos_points - crm_points`.
    pub discrepancy: i64,
    pub action: ReconciliationAction,
    pub status: ReconciliationStatus,
    pub notes: Option<String>,
    #[ts(as = "String")]
    pub detected_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Reconciliation counts for one business over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub total: i64,
    pub none: i64,
    pub auto_sync: i64,
    pub sync_with_log: i64,
    pub manual_review: i64,
    pub failed: i64,
    /// MANUAL_REVIEW records still awaiting an operator, regardless of age.
    pub pending_reviews: i64,
}

impl ReconciliationSummary {
    /// Adds `count` records of `action` to the totals.
    pub fn add(&mut self, action: ReconciliationAction, count: i64) {
        match action {
            ReconciliationAction::None => self.none += count,
            ReconciliationAction::AutoSync => self.auto_sync += count,
            ReconciliationAction::SyncWithLog => self.sync_with_log += count,
            ReconciliationAction::ManualReview => self.manual_review += count,
            ReconciliationAction::Failed => self.failed += count,
        }
        self.total += count;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_rank_orders_customers_first() {
        let mut kinds = vec![
            EntityType::Product,
            EntityType::Rental,
            EntityType::Customer,
            EntityType::Transaction,
        ];
        kinds.sort_by_key(|k| k.rank());
        assert_eq!(
            kinds,
            vec![
                EntityType::Customer,
                EntityType::Transaction,
                EntityType::Rental,
                EntityType::Product
            ]
        );
    }

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("customer".parse::<EntityType>().unwrap(), EntityType::Customer);
        assert_eq!("Transaction".parse::<EntityType>().unwrap(), EntityType::Transaction);
        assert!("invoice".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_requires_customer() {
        assert!(EntityType::Transaction.requires_customer());
        assert!(EntityType::Rental.requires_customer());
        assert!(!EntityType::Customer.requires_customer());
        assert!(!EntityType::Product.requires_customer());
    }

    #[test]
    fn test_active_statuses() {
        assert!(QueueStatus::Pending.is_active());
        assert!(QueueStatus::Processing.is_active());
        assert!(QueueStatus::Retry.is_active());
        assert!(!QueueStatus::Success.is_active());
        assert!(!QueueStatus::Failed.is_active());
    }

    #[test]
    fn test_priority_rank_descends() {
        assert!(SyncPriority::High.rank() > SyncPriority::Normal.rank());
        assert!(SyncPriority::Normal.rank() > SyncPriority::Low.rank());
        assert_eq!(SyncPriority::default(), SyncPriority::Normal);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(ReconciliationAction::SyncWithLog).unwrap(),
            serde_json::json!("SYNC_WITH_LOG")
        );
        assert_eq!(
            serde_json::to_value(EntityType::Rental).unwrap(),
            serde_json::json!("rental")
        );
    }

    #[test]
    fn test_customer_is_synced_needs_both_markers() {
        let now = Utc::now();
        let mut customer = Customer {
            id: "c1".into(),
            business_id: "b1".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: None,
            phone: None,
            address: None,
            city: None,
            state: None,
            postal_code: None,
            loyalty_points: 0,
            loyalty_tier: None,
            total_spent_cents: 0,
            visit_count: 0,
            marketing_opt_in: false,
            is_anonymous: false,
            is_active: true,
            external_id: Some("crm-1".into()),
            sync_state: CustomerSyncState::Pending,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!customer.is_synced());

        customer.sync_state = CustomerSyncState::Synced;
        assert!(customer.is_synced());

        customer.external_id = None;
        assert!(!customer.is_synced());
    }
}
