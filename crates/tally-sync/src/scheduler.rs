//! # Dependency Scheduler
//!
//! Picks due work in tier order and decides, per item, whether it can be
//! sent now.
//!
//! ## Tier Passes (one processor cycle)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  pass     statuses        priority   limit                              │
//! │  ───────  ──────────────  ─────────  ───────────────                    │
//! │  1        PENDING         HIGH       batch_size                         │
//! │  2        PENDING         NORMAL     batch_size                         │
//! │  3        PENDING         LOW        batch_size / 2                     │
//! │  4        RETRY           any        retry_batch_size                   │
//! │                                                                         │
//! │  Within a pass: priority DESC, customer < transaction < rental,        │
//! │  created_at ASC. Only items with scheduled_for <= now.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Readiness
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  customer     anonymous ─────────────────────────► Skip                 │
//! │               otherwise ─────────────────────────► Ready                │
//! │                                                                         │
//! │  transaction  no customer / anonymous customer ──► Skip                 │
//! │  rental       customer not synced ───────────────► WaitForCustomer      │
//! │               customer FAILED, nothing queued ───► Err(DependencyFailed)│
//! │               customer synced ───────────────────► Ready                │
//! │                                                                         │
//! │  product      (no CRM endpoint) ─────────────────► Skip                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A wait is not a failure: the item is pushed back by the dependency wait
//! without touching `retry_count`, and the customer is queued HIGH so it
//! goes out on the next cycle. A customer whose own sync ended FAILED is
//! not queued again from here; its dependents fail until an operator resets
//! the failed items.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use tally_core::{
    policy, CustomerSyncState, EnqueueRequest, EntityType, QueueStatus, SyncOperation,
    SyncPriority, SyncQueueItem,
};
use tally_db::Database;

/// Default pause before a transaction or rental waiting on its customer is
/// looked at again.
pub const DEFAULT_DEPENDENCY_WAIT_SECS: i64 = 30;

/// Whether an entity can be sent now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Send it.
    Ready,
    /// Nothing to send. The item completes without a CRM call.
    Skip(&'static str),
    /// The owning customer must reach the CRM first.
    WaitForCustomer { customer_id: String },
}

/// Tier selection and dependency checks over the sync queue.
#[derive(Debug, Clone)]
pub struct Scheduler {
    db: Database,
    dependency_wait: Duration,
}

impl Scheduler {
    pub fn new(db: Database, dependency_wait: Duration) -> Self {
        Scheduler {
            db,
            dependency_wait,
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Due PENDING and RETRY items in dispatch order, optionally restricted
    /// to one tier.
    pub async fn next_batch(
        &self,
        limit: i64,
        priority: Option<SyncPriority>,
    ) -> SyncResult<Vec<SyncQueueItem>> {
        self.select(
            &[QueueStatus::Pending, QueueStatus::Retry],
            priority,
            limit,
        )
        .await
    }

    /// Due PENDING items of one tier.
    pub async fn tier_batch(
        &self,
        priority: SyncPriority,
        limit: i64,
    ) -> SyncResult<Vec<SyncQueueItem>> {
        self.select(&[QueueStatus::Pending], Some(priority), limit)
            .await
    }

    /// Due RETRY items of any tier.
    pub async fn retry_batch(&self, limit: i64) -> SyncResult<Vec<SyncQueueItem>> {
        self.select(&[QueueStatus::Retry], None, limit).await
    }

    async fn select(
        &self,
        statuses: &[QueueStatus],
        priority: Option<SyncPriority>,
        limit: i64,
    ) -> SyncResult<Vec<SyncQueueItem>> {
        let mut items = self
            .db
            .queue()
            .due_items(statuses, priority, Utc::now(), limit)
            .await?;
        policy::sort_for_dispatch(&mut items);
        Ok(items)
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// Checks whether an entity can be sent now.
    ///
    /// ## Errors
    /// `EntityNotFound` when the entity (or the customer it references) no
    /// longer exists locally. `DependencyFailed` when the customer's sync
    /// ended FAILED and no queue item for it is active.
    pub async fn readiness(&self, entity_type: EntityType, entity_id: &str) -> SyncResult<Readiness> {
        let customer_id = match entity_type {
            EntityType::Customer => {
                let customer = self
                    .db
                    .customers()
                    .get(entity_id)
                    .await?
                    .ok_or_else(|| SyncError::not_found("Customer", entity_id))?;

                return Ok(if customer.is_anonymous {
                    Readiness::Skip("anonymous customer")
                } else {
                    Readiness::Ready
                });
            }
            EntityType::Transaction => self
                .db
                .transactions()
                .get(entity_id)
                .await?
                .ok_or_else(|| SyncError::not_found("Transaction", entity_id))?
                .customer_id,
            EntityType::Rental => self
                .db
                .rentals()
                .get(entity_id)
                .await?
                .ok_or_else(|| SyncError::not_found("Rental", entity_id))?
                .customer_id,
            EntityType::Product => return Ok(Readiness::Skip("products are not synced")),
        };

        let Some(customer_id) = customer_id else {
            return Ok(Readiness::Skip("walk-in sale without customer"));
        };

        let customer = self
            .db
            .customers()
            .get(&customer_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Customer", &customer_id))?;

        if customer.is_anonymous {
            return Ok(Readiness::Skip("anonymous customer"));
        }
        if customer.is_synced() {
            return Ok(Readiness::Ready);
        }
        if customer.sync_state == CustomerSyncState::Failed
            && self
                .db
                .queue()
                .find_active(EntityType::Customer, &customer_id)
                .await?
                .is_none()
        {
            return Err(SyncError::DependencyFailed { customer_id });
        }
        Ok(Readiness::WaitForCustomer { customer_id })
    }

    /// Pushes an item back for the dependency wait and queues its customer
    /// at HIGH priority.
    ///
    /// The item's `retry_count` and `last_error` are left unchanged.
    pub async fn defer_for_customer(
        &self,
        item: &SyncQueueItem,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.enqueue_customer_first(&item.business_id, customer_id)
            .await?;

        let scheduled_for = now + self.dependency_wait;
        self.db
            .queue()
            .defer(&item.id, scheduled_for, now)
            .await?;

        info!(
            item_id = %item.id,
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            customer_id = %customer_id,
            retry_at = %scheduled_for,
            "Waiting for customer sync"
        );
        Ok(())
    }

    /// Queues a customer at HIGH priority. An already-active item for the
    /// customer is reused as is.
    pub async fn enqueue_customer_first(
        &self,
        business_id: &str,
        customer_id: &str,
    ) -> SyncResult<SyncQueueItem> {
        let customer = self.db.customers().get(customer_id).await?;
        let operation = match customer.and_then(|c| c.external_id) {
            Some(_) => SyncOperation::Update,
            None => SyncOperation::Create,
        };

        let enqueued = self
            .db
            .queue()
            .enqueue(
                &EnqueueRequest::new(business_id, EntityType::Customer, customer_id, operation)
                    .priority(SyncPriority::High),
            )
            .await?;

        debug!(
            customer_id = %customer_id,
            item_id = %enqueued.item.id,
            created = enqueued.created,
            "Customer queued ahead of dependent"
        );
        Ok(enqueued.item)
    }
}
