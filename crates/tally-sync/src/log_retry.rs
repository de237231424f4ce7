//! # Sync Log Retry Job
//!
//! Manual "retry everything that failed" over the audit ledger. It works on
//! `sync_logs`, not on the live queue, so it can re-drive calls whose queue
//! items are long gone.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync_logs WHERE direction = OUTBOUND AND status = FAILED               │
//! │              AND resolved_at IS NULL AND attempt_count < max            │
//! │              AND (next_retry_at IS NULL OR next_retry_at <= now)        │
//! │              newest such row per entity, no later SUCCESS row           │
//! │        │                                                                │
//! │        ▼  for each row: readiness ──► adapter.resend_entity             │
//! │                                                                         │
//! │   ok        ──► every failed row of the entity resolved                 │
//! │   skip      ──► same (nothing left to send)                             │
//! │   wait      ──► untouched, picked up again next run                     │
//! │   err       ──► attempt_count += 1, next_retry_at = now + 5 min         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Re-dispatches do not append new ledger rows; the attempt is tracked on
//! the original row.

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::crm::CrmClient;
use crate::error::SyncResult;
use crate::scheduler::{Readiness, Scheduler};
use tally_core::SyncLogEntry;
use tally_db::Database;

/// Pause before a ledger row that failed again is eligible.
const LOG_RETRY_BACKOFF_MINS: i64 = 5;

/// Rows picked up per run.
const LOG_RETRY_BATCH: i64 = 100;

/// Counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRetryReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Still waiting on their customer. Not counted against the row.
    pub deferred: u64,
}

/// Re-drives failed outbound calls recorded in the ledger.
#[derive(Debug, Clone)]
pub struct SyncLogRetryJob {
    db: Database,
    crm: CrmClient,
    scheduler: Scheduler,
}

impl SyncLogRetryJob {
    pub fn new(db: Database, crm: CrmClient, scheduler: Scheduler) -> Self {
        SyncLogRetryJob { db, crm, scheduler }
    }

    pub async fn run(&self, max_attempts: u32) -> SyncResult<LogRetryReport> {
        let now = Utc::now();
        let entries = self
            .db
            .sync_logs()
            .due_for_retry(max_attempts as i64, now, LOG_RETRY_BATCH)
            .await?;

        let mut report = LogRetryReport::default();
        for entry in &entries {
            report.attempted += 1;
            match self.retry_entry(entry).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.deferred += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        log_id = %entry.id,
                        entity_type = %entry.entity_type,
                        entity_id = %entry.entity_id,
                        attempt = entry.attempt_count + 1,
                        error = %e,
                        "Sync log retry failed"
                    );
                    self.db
                        .sync_logs()
                        .record_retry_failure(
                            &entry.id,
                            &e.to_string(),
                            Utc::now() + Duration::minutes(LOG_RETRY_BACKOFF_MINS),
                        )
                        .await?;
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            "Sync log retry run complete"
        );
        Ok(report)
    }

    /// Returns false when the entity is still waiting on its customer.
    async fn retry_entry(&self, entry: &SyncLogEntry) -> SyncResult<bool> {
        match self
            .scheduler
            .readiness(entry.entity_type, &entry.entity_id)
            .await?
        {
            Readiness::WaitForCustomer { .. } => return Ok(false),
            Readiness::Skip(_) => {}
            Readiness::Ready => {
                self.crm
                    .resend_entity(&entry.business_id, entry.entity_type, &entry.entity_id)
                    .await?;
            }
        }

        self.db
            .sync_logs()
            .resolve_failures(entry.entity_type, &entry.entity_id, Utc::now())
            .await?;
        Ok(true)
    }
}
