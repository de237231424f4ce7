//! # Sync Queue Repository
//!
//! Durable store of outbound sync work and every state transition on it.
//!
//! ## Dedup on Insert
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  enqueue(customer, c-42)                                │
//! │                                                                         │
//! │  INSERT OR IGNORE INTO sync_queue (...)                                │
//! │       │                                                                 │
//! │       ├── 1 row  ──► new PENDING item            (created = true)      │
//! │       │                                                                 │
//! │       └── 0 rows ──► idx_sync_queue_active_entity already holds an     │
//! │                      item for (customer, c-42) in PENDING,             │
//! │                      PROCESSING or RETRY                               │
//! │                          │                                              │
//! │                          ▼                                              │
//! │                      SELECT that item             (created = false)    │
//! │                                                                         │
//! │  Two enqueuers racing on the same entity both land on the same row:   │
//! │  the partial unique index is the arbiter, not a read-then-write.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transitions
//! Every transition is a single-row `UPDATE ... WHERE id = ?`. The claim
//! (`mark_processing`) is additionally conditional on the current status so
//! a row can't be claimed twice.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{
    EnqueueRequest, EntityType, QueueStats, QueueStatus, SyncPriority, SyncQueueItem,
};

/// Columns selected into [`SyncQueueItem`].
const ITEM_COLUMNS: &str = "id, business_id, entity_type, entity_id, operation, priority, \
     status, retry_count, scheduled_for, last_error, payload, created_at, updated_at, processed_at";

/// How many times `enqueue` re-tries the insert when the conflicting active
/// item disappears between the insert and the lookup.
const ENQUEUE_ATTEMPTS: usize = 3;

/// Result of an enqueue call.
#[derive(Debug, Clone)]
pub struct Enqueued {
    /// The active item for the entity (new or pre-existing).
    pub item: SyncQueueItem,
    /// False when an active item already existed and was returned unchanged.
    pub created: bool,
}

/// Repository for the `sync_queue` table.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    pool: SqlitePool,
}

impl SyncQueueRepository {
    /// Creates a new SyncQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncQueueRepository { pool }
    }

    // =========================================================================
    // Insert / Lookup
    // =========================================================================

    /// Adds work for an entity unless an active item already exists.
    ///
    /// Never escalates the priority of an existing item and never raises an
    /// error for a duplicate.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let req = EnqueueRequest::new(&biz.id, EntityType::Customer, &c.id, SyncOperation::Create);
    /// let first = repo.enqueue(&req).await?;
    /// let second = repo.enqueue(&req).await?;
    /// assert_eq!(first.item.id, second.item.id);
    /// assert!(!second.created);
    /// ```
    pub async fn enqueue(&self, req: &EnqueueRequest) -> DbResult<Enqueued> {
        let payload = req
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        for _ in 0..ENQUEUE_ATTEMPTS {
            let id = Uuid::new_v4().to_string();
            let now = Utc::now();

            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO sync_queue (
                    id, business_id, entity_type, entity_id, operation,
                    priority, priority_rank, entity_rank, status, retry_count,
                    scheduled_for, last_error, payload, created_at, updated_at, processed_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8, 'PENDING', 0,
                    ?9, NULL, ?10, ?9, ?9, NULL
                )
                "#,
            )
            .bind(&id)
            .bind(&req.business_id)
            .bind(req.entity_type)
            .bind(&req.entity_id)
            .bind(req.operation)
            .bind(req.priority)
            .bind(req.priority.rank())
            .bind(req.entity_type.rank())
            .bind(now)
            .bind(&payload)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!(
                    item_id = %id,
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    priority = %req.priority,
                    "Enqueued sync item"
                );
                let item = self
                    .get(&id)
                    .await?
                    .ok_or_else(|| DbError::not_found("SyncQueueItem", id.as_str()))?;
                return Ok(Enqueued { item, created: true });
            }

            if let Some(item) = self.find_active(req.entity_type, &req.entity_id).await? {
                debug!(
                    item_id = %item.id,
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    status = %item.status,
                    "Active item already queued"
                );
                return Ok(Enqueued { item, created: false });
            }
        }

        Err(DbError::Internal(format!(
            "could not enqueue {} {}: active item kept changing",
            req.entity_type, req.entity_id
        )))
    }

    /// Gets an item by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<SyncQueueItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = ?1");
        let item = sqlx::query_as::<_, SyncQueueItem>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// Gets the active (PENDING, PROCESSING or RETRY) item for an entity.
    pub async fn find_active(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<Option<SyncQueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue \
             WHERE entity_type = ?1 AND entity_id = ?2 \
               AND status IN ('PENDING', 'PROCESSING', 'RETRY')"
        );
        let item = sqlx::query_as::<_, SyncQueueItem>(&sql)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// All items ever queued for an entity, oldest first.
    pub async fn history_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<Vec<SyncQueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue \
             WHERE entity_type = ?1 AND entity_id = ?2 \
             ORDER BY created_at ASC"
        );
        let items = sqlx::query_as::<_, SyncQueueItem>(&sql)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    /// Selects due items in dispatch order.
    ///
    /// ## Ordering
    /// ```text
    /// priority_rank DESC   HIGH > NORMAL > LOW
    /// entity_rank   ASC    customer < transaction < rental < product
    /// created_at    ASC    oldest first
    /// ```
    pub async fn due_items(
        &self,
        statuses: &[QueueStatus],
        priority: Option<SyncPriority>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<SyncQueueItem>> {
        if statuses.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE status IN ("
        ));
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");

        qb.push(" AND scheduled_for <= ").push_bind(now);

        if let Some(priority) = priority {
            qb.push(" AND priority = ").push_bind(priority);
        }

        qb.push(" ORDER BY priority_rank DESC, entity_rank ASC, created_at ASC LIMIT ")
            .push_bind(limit);

        let items = qb
            .build_query_as::<SyncQueueItem>()
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Claims an item for dispatch (PENDING/RETRY → PROCESSING).
    ///
    /// Returns false when the item is no longer claimable.
    pub async fn mark_processing(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'PROCESSING',
                updated_at = ?2
            WHERE id = ?1 AND status IN ('PENDING', 'RETRY')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// PROCESSING → SUCCESS, clears the error.
    pub async fn mark_success(&self, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'SUCCESS',
                last_error = NULL,
                processed_at = ?2,
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// PROCESSING → RETRY after a counted failure.
    pub async fn mark_retry(
        &self,
        id: &str,
        retry_count: i64,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'RETRY',
                retry_count = ?2,
                scheduled_for = ?3,
                last_error = ?4,
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(scheduled_for)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// PROCESSING → FAILED (terminal until a manual reset).
    pub async fn mark_failed(
        &self,
        id: &str,
        retry_count: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'FAILED',
                retry_count = ?2,
                last_error = ?3,
                processed_at = ?4,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// PROCESSING → RETRY for a dependency wait. `retry_count` and
    /// `last_error` are left alone.
    pub async fn defer(
        &self,
        id: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'RETRY',
                scheduled_for = ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(scheduled_for)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Resets items left in PROCESSING since before `cutoff` to RETRY, due now.
    pub async fn recover_stuck(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'RETRY',
                scheduled_for = ?2,
                last_error = COALESCE(last_error, 'recovered from stalled processing'),
                updated_at = ?2
            WHERE status = 'PROCESSING' AND updated_at < ?1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, cutoff = %cutoff, "Recovered stuck sync items");
        }
        Ok(recovered)
    }

    /// Manual bulk retry: FAILED → PENDING with a fresh retry budget.
    ///
    /// A FAILED row whose entity already has an active item is left FAILED
    /// (`UPDATE OR IGNORE` skips it instead of breaking the dedup index).
    pub async fn reset_failed(
        &self,
        business_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE OR IGNORE sync_queue SET
                status = 'PENDING',
                retry_count = 0,
                last_error = NULL,
                processed_at = NULL,
                scheduled_for = ?2,
                updated_at = ?2
            WHERE status = 'FAILED' AND (?1 IS NULL OR business_id = ?1)
            "#,
        )
        .bind(business_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        info!(reset, business_id = ?business_id, "Reset failed sync items");
        Ok(reset)
    }

    /// Deletes SUCCESS items processed before `cutoff`.
    pub async fn cleanup_old_items(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE status = 'SUCCESS' AND processed_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "Cleaned up old sync items");
        }
        Ok(deleted)
    }

    /// Counts items by status.
    pub async fn stats(&self, business_id: Option<&str>) -> DbResult<QueueStats> {
        let rows: Vec<(QueueStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM sync_queue
            WHERE (?1 IS NULL OR business_id = ?1)
            GROUP BY status
            "#,
        )
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Retry => stats.retry = count,
                QueueStatus::Success => stats.success = count,
                QueueStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// FAILED items, most recently updated first.
    pub async fn recent_failures(&self, limit: i64) -> DbResult<Vec<SyncQueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE status = 'FAILED' \
             ORDER BY updated_at DESC LIMIT ?1"
        );
        let items = sqlx::query_as::<_, SyncQueueItem>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tally_core::SyncOperation;

    use crate::pool::{Database, DbConfig};

    use super::*;

    async fn setup() -> SyncQueueRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.queue()
    }

    fn customer_req(id: &str) -> EnqueueRequest {
        EnqueueRequest::new("biz-1", EntityType::Customer, id, SyncOperation::Create)
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending_item() {
        let repo = setup().await;
        let before = Utc::now();

        let out = repo
            .enqueue(&customer_req("c-1").payload(serde_json::json!({"k": 1})))
            .await
            .unwrap();

        assert!(out.created);
        assert_eq!(out.item.status, QueueStatus::Pending);
        assert_eq!(out.item.retry_count, 0);
        assert_eq!(out.item.priority, SyncPriority::Normal);
        assert!(out.item.scheduled_for >= before - Duration::seconds(1));
        assert_eq!(out.item.payload.as_deref(), Some(r#"{"k":1}"#));
    }

    #[tokio::test]
    async fn test_enqueue_dedups_active_item() {
        let repo = setup().await;

        let first = repo.enqueue(&customer_req("c-1")).await.unwrap();
        let second = repo
            .enqueue(&customer_req("c-1").priority(SyncPriority::High))
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(first.item.id, second.item.id);
        // no escalation
        assert_eq!(second.item.priority, SyncPriority::Normal);

        let history = repo
            .history_for_entity(EntityType::Customer, "c-1")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_terminal_creates_new_item() {
        let repo = setup().await;
        let now = Utc::now();

        let first = repo.enqueue(&customer_req("c-1")).await.unwrap();
        repo.mark_processing(&first.item.id, now).await.unwrap();
        repo.mark_success(&first.item.id, now).await.unwrap();

        let second = repo.enqueue(&customer_req("c-1")).await.unwrap();
        assert!(second.created);
        assert_ne!(first.item.id, second.item.id);
    }

    #[tokio::test]
    async fn test_due_items_ordering() {
        let repo = setup().await;

        repo.enqueue(&EnqueueRequest::new(
            "biz-1",
            EntityType::Transaction,
            "t-1",
            SyncOperation::Create,
        ))
        .await
        .unwrap();
        repo.enqueue(&customer_req("c-1")).await.unwrap();
        repo.enqueue(
            &EnqueueRequest::new("biz-1", EntityType::Rental, "r-1", SyncOperation::Create)
                .priority(SyncPriority::High),
        )
        .await
        .unwrap();
        repo.enqueue(&customer_req("c-2").priority(SyncPriority::Low))
            .await
            .unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let due = repo
            .due_items(&[QueueStatus::Pending, QueueStatus::Retry], None, now, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|i| i.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "c-1", "t-1", "c-2"]);

        let normal_only = repo
            .due_items(&[QueueStatus::Pending], Some(SyncPriority::Normal), now, 10)
            .await
            .unwrap();
        assert_eq!(normal_only.len(), 2);
    }

    #[tokio::test]
    async fn test_due_items_skips_future_schedule() {
        let repo = setup().await;
        let now = Utc::now();

        let item = repo.enqueue(&customer_req("c-1")).await.unwrap().item;
        repo.mark_processing(&item.id, now).await.unwrap();
        repo.defer(&item.id, now + Duration::seconds(30), now)
            .await
            .unwrap();

        let due = repo
            .due_items(&[QueueStatus::Retry], None, now, 10)
            .await
            .unwrap();
        assert!(due.is_empty());

        let later = repo
            .due_items(&[QueueStatus::Retry], None, now + Duration::seconds(31), 10)
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_mark_processing_claims_once() {
        let repo = setup().await;
        let now = Utc::now();
        let item = repo.enqueue(&customer_req("c-1")).await.unwrap().item;

        assert!(repo.mark_processing(&item.id, now).await.unwrap());
        assert!(!repo.mark_processing(&item.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_stuck() {
        let repo = setup().await;
        let long_ago = Utc::now() - Duration::hours(2);
        let item = repo.enqueue(&customer_req("c-1")).await.unwrap().item;
        repo.mark_processing(&item.id, long_ago).await.unwrap();

        let now = Utc::now();
        let recovered = repo
            .recover_stuck(now - Duration::minutes(30), now)
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let item = repo.get(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Retry);
        assert!(item.scheduled_for <= Utc::now());
    }

    #[tokio::test]
    async fn test_reset_failed_respects_active_item() {
        let repo = setup().await;
        let now = Utc::now();

        let first = repo.enqueue(&customer_req("c-1")).await.unwrap().item;
        repo.mark_processing(&first.id, now).await.unwrap();
        repo.mark_failed(&first.id, 1, "boom", now).await.unwrap();

        // a newer active item for the same entity
        let second = repo.enqueue(&customer_req("c-1")).await.unwrap();
        assert!(second.created);

        let failed_other = repo.enqueue(&customer_req("c-2")).await.unwrap().item;
        repo.mark_processing(&failed_other.id, now).await.unwrap();
        repo.mark_failed(&failed_other.id, 4, "boom", now).await.unwrap();

        let reset = repo.reset_failed(None, now).await.unwrap();
        assert_eq!(reset, 1);

        let reset_item = repo.get(&failed_other.id).await.unwrap().unwrap();
        assert_eq!(reset_item.status, QueueStatus::Pending);
        assert_eq!(reset_item.retry_count, 0);
        assert!(reset_item.last_error.is_none());

        let still_failed = repo.get(&first.id).await.unwrap().unwrap();
        assert_eq!(still_failed.status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let repo = setup().await;
        let old = Utc::now() - Duration::days(10);

        let a = repo.enqueue(&customer_req("c-1")).await.unwrap().item;
        repo.mark_processing(&a.id, old).await.unwrap();
        repo.mark_success(&a.id, old).await.unwrap();
        repo.enqueue(&customer_req("c-2")).await.unwrap();

        let stats = repo.stats(None).await.unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 2);

        let deleted = repo
            .cleanup_old_items(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.stats(Some("biz-1")).await.unwrap().total, 1);
    }
}
