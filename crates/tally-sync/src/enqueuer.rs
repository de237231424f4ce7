//! # Enqueuer
//!
//! Entry point for local writes that must reach the CRM.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  enqueue(customer c1, UPDATE)                                           │
//! │        │                                                                │
//! │        ├── active item for (customer, c1)? ── yes ──► return it         │
//! │        │                                              (no new row)      │
//! │        └── no ──► INSERT PENDING, scheduled_for = now                   │
//! │                                                                         │
//! │  "active" = PENDING | PROCESSING | RETRY. Enforced by a partial unique  │
//! │  index, so two racing callers still end up with one row.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A duplicate call keeps the existing item as is: no priority bump and no
//! payload refresh. The adapter always reads the current entity at send
//! time, so nothing is lost.

use tracing::{debug, info};

use crate::error::SyncResult;
use tally_core::{EnqueueRequest, EntityType, SyncOperation, SyncPriority, SyncQueueItem};
use tally_db::Database;

/// Adds outbound work to the sync queue.
#[derive(Debug, Clone)]
pub struct Enqueuer {
    db: Database,
}

impl Enqueuer {
    pub fn new(db: Database) -> Self {
        Enqueuer { db }
    }

    /// Enqueues a request, returning the item that now represents it.
    pub async fn enqueue(&self, req: EnqueueRequest) -> SyncResult<SyncQueueItem> {
        let enqueued = self.db.queue().enqueue(&req).await?;

        if enqueued.created {
            info!(
                item_id = %enqueued.item.id,
                entity_type = %req.entity_type,
                entity_id = %req.entity_id,
                operation = %req.operation,
                priority = %req.priority,
                "Queued for CRM sync"
            );
        } else {
            debug!(
                item_id = %enqueued.item.id,
                entity_type = %req.entity_type,
                entity_id = %req.entity_id,
                "Already queued, reusing active item"
            );
        }

        Ok(enqueued.item)
    }

    /// Shorthand for a customer write.
    pub async fn customer(
        &self,
        business_id: &str,
        customer_id: &str,
        operation: SyncOperation,
        priority: SyncPriority,
    ) -> SyncResult<SyncQueueItem> {
        self.enqueue(
            EnqueueRequest::new(business_id, EntityType::Customer, customer_id, operation)
                .priority(priority),
        )
        .await
    }

    /// Shorthand for a completed transaction.
    pub async fn transaction(
        &self,
        business_id: &str,
        transaction_id: &str,
    ) -> SyncResult<SyncQueueItem> {
        self.enqueue(EnqueueRequest::new(
            business_id,
            EntityType::Transaction,
            transaction_id,
            SyncOperation::Create,
        ))
        .await
    }

    /// Shorthand for a rental write.
    pub async fn rental(
        &self,
        business_id: &str,
        rental_id: &str,
        operation: SyncOperation,
    ) -> SyncResult<SyncQueueItem> {
        self.enqueue(EnqueueRequest::new(
            business_id,
            EntityType::Rental,
            rental_id,
            operation,
        ))
        .await
    }
}
