//! # Admin Routes
//!
//! Manual triggers and read-only statistics for operators. Served on the
//! loopback admin listener only; there is no authentication layer.
//!
//! ```text
//! GET  /admin/sync/status                          processor status + queue stats
//! POST /admin/sync/run                             one cycle now (409 if busy)
//! POST /admin/sync/retry-failed                    FAILED → PENDING
//! POST /admin/sync/log-retry                       re-drive failed ledger rows
//! POST /admin/reconciliation/run                   all or { businessId } (409 if busy)
//! POST /admin/reconciliation/customers/{id}        one customer
//! GET  /admin/reconciliation/summary               ?businessId=&days=
//! GET  /admin/reconciliation/reviews               ?businessId=&limit=
//! POST /admin/reconciliation/reviews/{id}/resolve  { notes }
//! GET  /admin/health                               database + CRM
//! ```

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::crm::CrmClient;
use crate::log_retry::{LogRetryReport, SyncLogRetryJob};
use crate::processor::{CycleReport, ProcessorStatus, SyncProcessor};
use crate::reconciliation::{BusinessReconciliation, ReconciliationEngine};
use tally_core::{LoyaltyReconciliation, QueueStats, ReconciliationSummary, SyncQueueItem};
use tally_db::Database;

/// Default look-back for the reconciliation summary.
const DEFAULT_SUMMARY_DAYS: i64 = 30;

/// Default page size for the review queue.
const DEFAULT_REVIEW_LIMIT: i64 = 50;

/// Failures shown on the status page.
const RECENT_FAILURES: i64 = 20;

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// State & Router
// =============================================================================

/// Everything the admin handlers reach into.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub db: Database,
    pub crm: CrmClient,
    pub processor: Arc<SyncProcessor>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub log_retry: SyncLogRetryJob,
    /// Attempt ceiling for the sync log retry job.
    pub max_attempts: u32,
}

/// Builds the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/sync/status", get(sync_status))
        .route("/admin/sync/run", post(run_sync))
        .route("/admin/sync/retry-failed", post(retry_failed))
        .route("/admin/sync/log-retry", post(log_retry))
        .route("/admin/reconciliation/run", post(run_reconciliation))
        .route(
            "/admin/reconciliation/customers/{id}",
            post(reconcile_customer),
        )
        .route("/admin/reconciliation/summary", get(reconciliation_summary))
        .route("/admin/reconciliation/reviews", get(pending_reviews))
        .route(
            "/admin/reconciliation/reviews/{id}/resolve",
            post(resolve_review),
        )
        .route("/admin/health", get(health))
        .with_state(state)
}

// =============================================================================
// Sync
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub processor: ProcessorStatus,
    pub queue: QueueStats,
    pub recent_failures: Vec<SyncQueueItem>,
}

async fn sync_status(State(state): State<AdminState>) -> ApiResult<SyncStatusResponse> {
    let queue = state.db.queue();
    Ok(Json(SyncStatusResponse {
        processor: state.processor.status().await,
        queue: queue.stats(None).await.map_err(crate::SyncError::from)?,
        recent_failures: queue
            .recent_failures(RECENT_FAILURES)
            .await
            .map_err(crate::SyncError::from)?,
    }))
}

async fn run_sync(State(state): State<AdminState>) -> ApiResult<CycleReport> {
    Ok(Json(state.processor.trigger_now().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessFilter {
    pub business_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub reset: u64,
}

async fn retry_failed(
    State(state): State<AdminState>,
    Query(filter): Query<BusinessFilter>,
) -> ApiResult<ResetResponse> {
    let reset = state
        .db
        .queue()
        .reset_failed(filter.business_id.as_deref(), Utc::now())
        .await
        .map_err(crate::SyncError::from)?;
    Ok(Json(ResetResponse { reset }))
}

async fn log_retry(State(state): State<AdminState>) -> ApiResult<LogRetryReport> {
    Ok(Json(state.log_retry.run(state.max_attempts).await?))
}

// =============================================================================
// Reconciliation
// =============================================================================

async fn run_reconciliation(
    State(state): State<AdminState>,
    body: Option<Json<BusinessFilter>>,
) -> ApiResult<Vec<BusinessReconciliation>> {
    let filter = body.map(|Json(f)| f).unwrap_or_default();
    let results = match filter.business_id {
        Some(business_id) => vec![state.reconciliation.reconcile_business(&business_id).await?],
        None => state.reconciliation.reconcile_all().await?,
    };
    Ok(Json(results))
}

async fn reconcile_customer(
    State(state): State<AdminState>,
    Path(customer_id): Path<String>,
) -> ApiResult<LoyaltyReconciliation> {
    Ok(Json(
        state.reconciliation.reconcile_customer(&customer_id).await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub business_id: String,
    pub days: Option<i64>,
}

async fn reconciliation_summary(
    State(state): State<AdminState>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<ReconciliationSummary> {
    let days = query.days.unwrap_or(DEFAULT_SUMMARY_DAYS).max(0);
    Ok(Json(
        state
            .reconciliation
            .summary(&query.business_id, days)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewsQuery {
    pub business_id: String,
    pub limit: Option<i64>,
}

async fn pending_reviews(
    State(state): State<AdminState>,
    Query(query): Query<ReviewsQuery>,
) -> ApiResult<Vec<LoyaltyReconciliation>> {
    let limit = query.limit.unwrap_or(DEFAULT_REVIEW_LIMIT).clamp(1, 500);
    Ok(Json(
        state
            .reconciliation
            .pending_reviews(&query.business_id, limit)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub notes: Option<String>,
}

async fn resolve_review(
    State(state): State<AdminState>,
    Path(record_id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<LoyaltyReconciliation> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(
        state
            .reconciliation
            .resolve_review(&record_id, request.notes.as_deref())
            .await?,
    ))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub database: bool,
    pub crm: bool,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let (database, crm) = tokio::join!(state.db.health_check(), state.crm.health_check());
    Json(HealthResponse { database, crm })
}
