//! # Sync Processor
//!
//! Timer-driven loop that drains the sync queue into the CRM.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SyncProcessor::cycle                               │
//! │                                                                         │
//! │  0. Guard        single-flight; a busy tick is dropped, not queued      │
//! │  1. Recover      PROCESSING older than stuck threshold → RETRY (now)    │
//! │  2. Tier passes  HIGH, NORMAL, LOW (half batch)       PENDING only      │
//! │  3. Retry pass   retry_batch_size                     RETRY only        │
//! │  4. Cleanup      SUCCESS older than retention → deleted                 │
//! │                                                                         │
//! │  Each item, strictly one after another:                                 │
//! │                                                                         │
//! │   claim ──► readiness ──┬── Skip ─────────────► SUCCESS (no call)       │
//! │                         ├── WaitForCustomer ──► RETRY +30s, count kept  │
//! │                         │                       customer queued HIGH    │
//! │                         └── Ready ──► CRM ──┬── ok ──► SUCCESS          │
//! │                                             └── err ─► RetryPolicy      │
//! │                                                        RETRY / FAILED   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One item's failure never aborts the batch. An error in the cycle itself
//! (e.g. the store is unreachable) is logged and the loop waits for the
//! next tick.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ProcessorSettings;
use crate::crm::CrmClient;
use crate::error::{SyncError, SyncResult};
use crate::guard::SingleFlight;
use crate::scheduler::{Readiness, Scheduler};
use tally_core::policy::{self, FailureOutcome, RetryPolicy};
use tally_core::{EntityType, SyncPriority, SyncQueueItem};
use tally_db::Database;

// =============================================================================
// Reports
// =============================================================================

/// Counts for one processor cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Stuck PROCESSING items reset at the start of the cycle.
    pub recovered: u64,
    /// Items claimed and handled.
    pub processed: u64,
    /// Sent to the CRM successfully.
    pub succeeded: u64,
    /// Went terminal FAILED.
    pub failed: u64,
    /// Rescheduled after a retryable failure.
    pub retried: u64,
    /// Waiting on their customer.
    pub deferred: u64,
    /// Completed without a CRM call (anonymous, walk-in, product).
    pub skipped: u64,
    /// Old SUCCESS items deleted.
    pub cleaned: u64,
}

/// Processor state as seen by the admin routes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStatus {
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Skipped,
    Deferred,
    /// Another worker claimed it first.
    NotClaimed,
}

// =============================================================================
// Processor
// =============================================================================

/// Drains the sync queue on a timer.
pub struct SyncProcessor {
    db: Database,
    crm: CrmClient,
    scheduler: Scheduler,
    settings: ProcessorSettings,
    policy: RetryPolicy,
    flight: SingleFlight,
    status: RwLock<ProcessorStatus>,
}

impl SyncProcessor {
    pub fn new(db: Database, crm: CrmClient, settings: ProcessorSettings) -> Self {
        let scheduler = Scheduler::new(db.clone(), settings.dependency_wait());
        SyncProcessor {
            policy: settings.retry_policy(),
            db,
            crm,
            scheduler,
            settings,
            flight: SingleFlight::new("Sync processor"),
            status: RwLock::new(ProcessorStatus::default()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn status(&self) -> ProcessorStatus {
        let mut status = self.status.read().await.clone();
        status.is_running = self.flight.is_running();
        status
    }

    /// Runs the timer loop until shutdown is requested.
    ///
    /// This should be spawned as a background task.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            interval_secs = self.settings.interval_secs,
            batch_size = self.settings.batch_size,
            "Sync processor starting"
        );

        let mut interval = tokio::time::interval(self.settings.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync processor shutting down");
                    break;
                }
            }
        }

        info!("Sync processor stopped");
    }

    /// Timer entry point: runs a cycle unless one is in flight, in which
    /// case the tick is dropped.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Some(_guard) = self.flight.try_acquire() else {
            debug!("Processor cycle already running, tick dropped");
            return None;
        };

        match self.cycle_and_record().await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Processor cycle failed");
                None
            }
        }
    }

    /// Manual entry point: runs a cycle now.
    ///
    /// ## Errors
    /// `AlreadyRunning` when a cycle is in flight.
    pub async fn trigger_now(&self) -> SyncResult<CycleReport> {
        let _guard = self
            .flight
            .try_acquire()
            .ok_or(SyncError::AlreadyRunning(self.flight.name()))?;

        info!("Manual processor cycle triggered");
        self.cycle_and_record().await
    }

    async fn cycle_and_record(&self) -> SyncResult<CycleReport> {
        let started = Utc::now();
        let result = self.cycle().await;

        let mut status = self.status.write().await;
        status.last_run_at = Some(started);
        match &result {
            Ok(report) => {
                status.last_report = Some(*report);
                status.last_error = None;
            }
            Err(e) => status.last_error = Some(e.to_string()),
        }

        result
    }

    async fn cycle(&self) -> SyncResult<CycleReport> {
        let queue = self.db.queue();
        let mut report = CycleReport::default();

        let now = Utc::now();
        report.recovered = queue
            .recover_stuck(
                policy::stuck_cutoff(now, self.settings.stuck_threshold()),
                now,
            )
            .await?;

        let batch = self.settings.batch_size;
        let tiers = [
            (SyncPriority::High, batch),
            (SyncPriority::Normal, batch),
            (SyncPriority::Low, (batch / 2).max(1)),
        ];
        for (priority, limit) in tiers {
            let items = self.scheduler.tier_batch(priority, limit).await?;
            if !items.is_empty() {
                debug!(priority = %priority, count = items.len(), "Processing tier");
            }
            self.process_items(items, &mut report).await;
        }

        let retries = self
            .scheduler
            .retry_batch(self.settings.retry_batch_size)
            .await?;
        if !retries.is_empty() {
            debug!(count = retries.len(), "Processing retries");
        }
        self.process_items(retries, &mut report).await;

        let retention_cutoff = Utc::now() - ChronoDuration::days(self.settings.retention_days);
        report.cleaned = queue.cleanup_old_items(retention_cutoff).await?;

        if report.processed > 0 || report.recovered > 0 {
            info!(
                recovered = report.recovered,
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                retried = report.retried,
                deferred = report.deferred,
                skipped = report.skipped,
                cleaned = report.cleaned,
                "Processor cycle complete"
            );
        } else {
            debug!("Processor cycle found no due items");
        }

        Ok(report)
    }

    async fn process_items(&self, items: Vec<SyncQueueItem>, report: &mut CycleReport) {
        let delay = self.settings.item_delay();

        for (index, item) in items.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.process_item(item).await {
                Ok(ItemOutcome::NotClaimed) => continue,
                Ok(ItemOutcome::Sent) => report.succeeded += 1,
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Ok(ItemOutcome::Deferred) => report.deferred += 1,
                Err(e) => match self.handle_failure(item, &e).await {
                    Ok(FailureOutcome::Retry { .. }) => report.retried += 1,
                    Ok(FailureOutcome::Failed { .. }) => report.failed += 1,
                    Err(store_err) => {
                        error!(
                            item_id = %item.id,
                            error = %store_err,
                            original_error = %e,
                            "Failed to record sync failure"
                        );
                    }
                },
            }
            report.processed += 1;
        }
    }

    /// Claims and handles one item. An `Err` is a failed attempt for the
    /// retry policy to judge.
    async fn process_item(&self, item: &SyncQueueItem) -> SyncResult<ItemOutcome> {
        let queue = self.db.queue();

        if !queue.mark_processing(&item.id, Utc::now()).await? {
            debug!(item_id = %item.id, "Item no longer claimable");
            return Ok(ItemOutcome::NotClaimed);
        }

        debug!(
            item_id = %item.id,
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            operation = %item.operation,
            retry_count = item.retry_count,
            "Dispatching sync item"
        );

        match self
            .scheduler
            .readiness(item.entity_type, &item.entity_id)
            .await?
        {
            Readiness::Skip(reason) => {
                queue.mark_success(&item.id, Utc::now()).await?;
                debug!(item_id = %item.id, reason, "Completed without CRM call");
                Ok(ItemOutcome::Skipped)
            }
            Readiness::WaitForCustomer { customer_id } => {
                self.scheduler
                    .defer_for_customer(item, &customer_id, Utc::now())
                    .await?;
                Ok(ItemOutcome::Deferred)
            }
            Readiness::Ready => {
                self.crm
                    .sync_entity(
                        &item.business_id,
                        item.entity_type,
                        &item.entity_id,
                        item.operation,
                    )
                    .await?;
                queue.mark_success(&item.id, Utc::now()).await?;
                info!(
                    item_id = %item.id,
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    "Sync item succeeded"
                );
                Ok(ItemOutcome::Sent)
            }
        }
    }

    /// Applies the retry policy to a failed attempt.
    async fn handle_failure(
        &self,
        item: &SyncQueueItem,
        err: &SyncError,
    ) -> SyncResult<FailureOutcome> {
        let now = Utc::now();
        let message = err.to_string();
        let outcome = self
            .policy
            .on_failure(item.retry_count, err.is_retryable(), now);

        match outcome {
            FailureOutcome::Retry {
                retry_count,
                scheduled_for,
            } => {
                self.db
                    .queue()
                    .mark_retry(&item.id, retry_count, scheduled_for, &message, now)
                    .await?;
                warn!(
                    item_id = %item.id,
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    retry_count,
                    retry_at = %scheduled_for,
                    error = %message,
                    "Sync item failed, will retry"
                );
            }
            FailureOutcome::Failed { retry_count } => {
                self.db
                    .queue()
                    .mark_failed(&item.id, retry_count, &message, now)
                    .await?;
                if item.entity_type == EntityType::Customer {
                    self.db.customers().mark_sync_failed(&item.entity_id).await?;
                }
                error!(
                    item_id = %item.id,
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    retry_count,
                    retryable = err.is_retryable(),
                    error = %message,
                    "Sync item failed permanently"
                );
            }
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for SyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProcessor")
            .field("settings", &self.settings)
            .field("running", &self.flight.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tally_core::{EnqueueRequest, QueueStatus, SyncOperation};
    use tally_db::{DbConfig, NewCustomer};

    use super::*;
    use crate::config::CrmSettings;

    async fn setup() -> (Database, SyncProcessor, String) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let business = db.businesses().insert("Shop", Some("tenant-a")).await.unwrap();

        // Nothing listens here; tests below never reach the network.
        let crm_settings = CrmSettings {
            base_url: "http://127.0.0.1:9".into(),
            integration_secret: "secret".into(),
            ..Default::default()
        };
        let crm = CrmClient::new(&crm_settings, db.clone()).unwrap();
        let settings = ProcessorSettings {
            item_delay_ms: 0,
            ..Default::default()
        };
        (db.clone(), SyncProcessor::new(db, crm, settings), business.id)
    }

    #[tokio::test]
    async fn test_trigger_now_rejected_while_running() {
        let (_db, processor, _biz) = setup().await;

        let _held = processor.flight.try_acquire().unwrap();
        let err = processor.trigger_now().await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning(_)));
        assert!(processor.run_cycle().await.is_none());
        assert!(processor.status().await.is_running);
    }

    #[tokio::test]
    async fn test_anonymous_customer_completes_without_call() {
        let (db, processor, biz) = setup().await;
        let anon = db.customers().insert(&NewCustomer::anonymous(&biz)).await.unwrap();
        let item = db
            .queue()
            .enqueue(&EnqueueRequest::new(
                &biz,
                EntityType::Customer,
                &anon.id,
                SyncOperation::Create,
            ))
            .await
            .unwrap()
            .item;

        let report = processor.trigger_now().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);

        let done = db.queue().get(&item.id).await.unwrap().unwrap();
        assert_eq!(done.status, QueueStatus::Success);
        assert!(db
            .sync_logs()
            .list_for_entity(EntityType::Customer, &anon.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_entity_fails_without_retry() {
        let (db, processor, biz) = setup().await;
        let item = db
            .queue()
            .enqueue(&EnqueueRequest::new(
                &biz,
                EntityType::Transaction,
                "gone",
                SyncOperation::Create,
            ))
            .await
            .unwrap()
            .item;

        let report = processor.trigger_now().await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = db.queue().get(&item.id).await.unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.unwrap().contains("not found"));

        let status = processor.status().await;
        assert_eq!(status.last_report, Some(report));
        assert!(status.last_run_at.is_some());
    }
}
