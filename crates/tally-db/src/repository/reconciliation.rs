//! # Loyalty Reconciliation Repository
//!
//! One row per customer per reconciliation pass, plus the operator review
//! queue (MANUAL_REVIEW rows still PENDING).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{
    DriftDecision, LoyaltyReconciliation, ReconciliationAction, ReconciliationStatus,
    ReconciliationSummary,
};

const RECORD_COLUMNS: &str = "id, business_id, customer_id, pos_points, crm_points, discrepancy, \
     action, status, notes, detected_at, resolved_at";

/// Repository for the `loyalty_reconciliations` table.
#[derive(Debug, Clone)]
pub struct ReconciliationRepository {
    pool: SqlitePool,
}

impl ReconciliationRepository {
    /// Creates a new ReconciliationRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReconciliationRepository { pool }
    }

    /// Records the outcome for one customer. RESOLVED outcomes are stamped
    /// resolved at detection time.
    pub async fn insert(
        &self,
        business_id: &str,
        customer_id: &str,
        decision: &DriftDecision,
        detected_at: DateTime<Utc>,
    ) -> DbResult<LoyaltyReconciliation> {
        let record = LoyaltyReconciliation {
            id: Uuid::new_v4().to_string(),
            business_id: business_id.to_string(),
            customer_id: customer_id.to_string(),
            pos_points: decision.pos_points,
            crm_points: decision.crm_points,
            discrepancy: decision.discrepancy,
            action: decision.action,
            status: decision.status,
            notes: Some(decision.note.clone()),
            detected_at,
            resolved_at: (decision.status == ReconciliationStatus::Resolved).then_some(detected_at),
        };

        sqlx::query(
            r#"
            INSERT INTO loyalty_reconciliations (
                id, business_id, customer_id, pos_points, crm_points, discrepancy,
                action, status, notes, detected_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&record.id)
        .bind(&record.business_id)
        .bind(&record.customer_id)
        .bind(record.pos_points)
        .bind(record.crm_points)
        .bind(record.discrepancy)
        .bind(record.action)
        .bind(record.status)
        .bind(&record.notes)
        .bind(record.detected_at)
        .bind(record.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// Gets a record by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<LoyaltyReconciliation>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM loyalty_reconciliations WHERE id = ?1");
        let record = sqlx::query_as::<_, LoyaltyReconciliation>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// The operator queue: MANUAL_REVIEW records still PENDING, oldest first.
    pub async fn pending_reviews(
        &self,
        business_id: &str,
        limit: i64,
    ) -> DbResult<Vec<LoyaltyReconciliation>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM loyalty_reconciliations \
             WHERE business_id = ?1 AND action = 'MANUAL_REVIEW' AND status = 'PENDING' \
             ORDER BY detected_at ASC LIMIT ?2"
        );
        let records = sqlx::query_as::<_, LoyaltyReconciliation>(&sql)
            .bind(business_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Operator sign-off on a PENDING record.
    ///
    /// ## Errors
    /// `NotFound` when no PENDING record has this id.
    pub async fn resolve(
        &self,
        id: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<LoyaltyReconciliation> {
        let result = sqlx::query(
            r#"
            UPDATE loyalty_reconciliations SET
                status = 'RESOLVED',
                resolved_at = ?2,
                notes = CASE
                    WHEN ?3 IS NULL THEN notes
                    WHEN notes IS NULL THEN ?3
                    ELSE notes || char(10) || ?3
                END
            WHERE id = ?1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Pending reconciliation", id));
        }

        info!(record_id = %id, "Reconciliation review resolved");
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found("Reconciliation", id))
    }

    /// Counts by action for records detected since `since`, plus the
    /// current size of the review queue.
    pub async fn summary(
        &self,
        business_id: &str,
        since: DateTime<Utc>,
    ) -> DbResult<ReconciliationSummary> {
        let rows: Vec<(ReconciliationAction, i64)> = sqlx::query_as(
            r#"
            SELECT action, COUNT(*) FROM loyalty_reconciliations
            WHERE business_id = ?1 AND detected_at >= ?2
            GROUP BY action
            "#,
        )
        .bind(business_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReconciliationSummary::default();
        for (action, count) in rows {
            summary.add(action, count);
        }

        summary.pending_reviews = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM loyalty_reconciliations
            WHERE business_id = ?1 AND action = 'MANUAL_REVIEW' AND status = 'PENDING'
            "#,
        )
        .bind(business_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(summary)
    }

    /// All records for one customer, newest first.
    pub async fn history(&self, customer_id: &str) -> DbResult<Vec<LoyaltyReconciliation>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM loyalty_reconciliations \
             WHERE customer_id = ?1 ORDER BY detected_at DESC"
        );
        let records = sqlx::query_as::<_, LoyaltyReconciliation>(&sql)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tally_core::drift::{self, DriftThresholds};

    use crate::pool::{Database, DbConfig};

    use super::*;

    #[tokio::test]
    async fn test_review_queue_and_resolution() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.reconciliations();
        let t = DriftThresholds::default();
        let now = Utc::now();

        let auto = repo.insert("biz-1", "c-1", &t.classify(150, 145), now).await.unwrap();
        assert_eq!(auto.status, ReconciliationStatus::Resolved);
        assert!(auto.resolved_at.is_some());

        let review = repo.insert("biz-1", "c-2", &t.classify(500, 200), now).await.unwrap();
        assert!(review.resolved_at.is_none());

        let queue = repo.pending_reviews("biz-1", 10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, review.id);

        let resolved = repo
            .resolve(&review.id, Some("customer confirmed 200"), now)
            .await
            .unwrap();
        assert_eq!(resolved.status, ReconciliationStatus::Resolved);
        assert!(resolved.notes.unwrap().ends_with("customer confirmed 200"));
        assert!(repo.pending_reviews("biz-1", 10).await.unwrap().is_empty());

        // a second sign-off finds nothing pending
        let err = repo.resolve(&review.id, None, now).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_summary_counts_by_action() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.reconciliations();
        let t = DriftThresholds::default();
        let now = Utc::now();

        repo.insert("biz-1", "c-1", &t.classify(100, 100), now).await.unwrap();
        repo.insert("biz-1", "c-2", &t.classify(150, 145), now).await.unwrap();
        repo.insert("biz-1", "c-3", &t.classify(500, 200), now).await.unwrap();
        repo.insert("biz-1", "c-4", &drift::fetch_failed(80, "timeout"), now)
            .await
            .unwrap();
        repo.insert("biz-1", "c-5", &t.classify(60, 0), now - Duration::days(30))
            .await
            .unwrap();
        repo.insert("biz-2", "c-9", &t.classify(1, 0), now).await.unwrap();

        let summary = repo.summary("biz-1", now - Duration::days(7)).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.none, 1);
        assert_eq!(summary.auto_sync, 1);
        assert_eq!(summary.manual_review, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sync_with_log, 0);
        assert_eq!(summary.pending_reviews, 1);

        assert_eq!(repo.history("c-4").await.unwrap().len(), 1);
    }
}
