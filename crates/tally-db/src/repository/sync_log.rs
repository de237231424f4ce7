//! # Sync Log Repository
//!
//! Append-only audit ledger of every attempted CRM call.
//!
//! Rows are written once by the CRM adapter. The only later mutations are the
//! retry bookkeeping columns (`attempt_count`, `next_retry_at`,
//! `error_message`, `resolved_at`), touched by the log retry job and by a
//! later successful send of the same entity.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use tally_core::{EntityType, SyncDirection, SyncLogEntry, SyncLogStatus, SyncOperation};

const LOG_COLUMNS: &str = "id, business_id, direction, entity_type, entity_id, operation, status, \
     payload, error_message, http_status, attempt_count, next_retry_at, resolved_at, created_at";

/// Fields of a new ledger row.
#[derive(Debug, Clone)]
pub struct NewSyncLog {
    pub business_id: String,
    pub direction: SyncDirection,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub status: SyncLogStatus,
    pub payload: Option<String>,
    pub error_message: Option<String>,
    pub http_status: Option<i64>,
}

/// Repository for the `sync_logs` table.
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    /// Creates a new SyncLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    /// Appends a ledger row.
    pub async fn insert(&self, entry: &NewSyncLog) -> DbResult<SyncLogEntry> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO sync_logs (
                id, business_id, direction, entity_type, entity_id, operation,
                status, payload, error_message, http_status, attempt_count,
                next_retry_at, resolved_at, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, 1,
                NULL, NULL, ?11
            )
            "#,
        )
        .bind(&id)
        .bind(&entry.business_id)
        .bind(entry.direction)
        .bind(entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.operation)
        .bind(entry.status)
        .bind(&entry.payload)
        .bind(&entry.error_message)
        .bind(entry.http_status)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            log_id = %id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            status = ?entry.status,
            "Sync attempt logged"
        );

        Ok(SyncLogEntry {
            id,
            business_id: entry.business_id.clone(),
            direction: entry.direction,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            status: entry.status,
            payload: entry.payload.clone(),
            error_message: entry.error_message.clone(),
            http_status: entry.http_status,
            attempt_count: 1,
            next_retry_at: None,
            resolved_at: None,
            created_at: now,
        })
    }

    /// Gets a ledger row by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<SyncLogEntry>> {
        let sql = format!("SELECT {LOG_COLUMNS} FROM sync_logs WHERE id = ?1");
        let entry = sqlx::query_as::<_, SyncLogEntry>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Unresolved outbound failures eligible for another attempt.
    ///
    /// One row per entity: the newest unresolved failure stands in for the
    /// older ones. Entities with a SUCCESS row newer than that failure are
    /// left out.
    pub async fn due_for_retry(
        &self,
        max_attempts: i64,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<SyncLogEntry>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM sync_logs AS l \
             WHERE l.direction = 'OUTBOUND' AND l.status = 'FAILED' \
               AND l.resolved_at IS NULL \
               AND l.attempt_count < ?1 \
               AND (l.next_retry_at IS NULL OR l.next_retry_at <= ?2) \
               AND l.id = ( \
                   SELECT f.id FROM sync_logs AS f \
                   WHERE f.direction = 'OUTBOUND' AND f.status = 'FAILED' \
                     AND f.resolved_at IS NULL \
                     AND f.entity_type = l.entity_type AND f.entity_id = l.entity_id \
                   ORDER BY f.created_at DESC, f.id DESC LIMIT 1) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM sync_logs AS s \
                   WHERE s.direction = 'OUTBOUND' AND s.status = 'SUCCESS' \
                     AND s.entity_type = l.entity_type AND s.entity_id = l.entity_id \
                     AND s.created_at > l.created_at) \
             ORDER BY l.created_at ASC LIMIT ?3"
        );
        let entries = sqlx::query_as::<_, SyncLogEntry>(&sql)
            .bind(max_attempts)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    /// Resolves every unresolved outbound failure of an entity. Called once
    /// the entity has reached the CRM.
    pub async fn resolve_failures(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_logs SET resolved_at = ?3, next_retry_at = NULL
            WHERE direction = 'OUTBOUND' AND status = 'FAILED' AND resolved_at IS NULL
              AND entity_type = ?1 AND entity_id = ?2
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let resolved = result.rows_affected();
        if resolved > 0 {
            debug!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                resolved,
                "Resolved failed sync attempts"
            );
        }
        Ok(resolved)
    }

    /// Counts another failed attempt on a ledger row.
    pub async fn record_retry_failure(
        &self,
        id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_logs SET
                attempt_count = attempt_count + 1,
                error_message = ?2,
                next_retry_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ledger rows for one entity, newest first.
    pub async fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<Vec<SyncLogEntry>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM sync_logs \
             WHERE entity_type = ?1 AND entity_id = ?2 \
             ORDER BY created_at DESC"
        );
        let entries = sqlx::query_as::<_, SyncLogEntry>(&sql)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }
}
