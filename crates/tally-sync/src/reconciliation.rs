//! # Loyalty Reconciliation Engine
//!
//! Compares each synced customer's POS point balance with the CRM's and
//! resolves drift by threshold.
//!
//! ## Business Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  businesses with crm_tenant_id                                          │
//! │        │                                                                │
//! │        ▼  customers: active, not anonymous, external_id set             │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │  GET /customers/{external_id} ──┬── ok ──► classify(pos, crm)      │ │
//! │  │                                 └── err ─► FAILED (crm = 0)        │ │
//! │  │                                                                   │ │
//! │  │  AUTO_SYNC / SYNC_WITH_LOG ──► local balance := crm               │ │
//! │  │  MANUAL_REVIEW ──────────────► PENDING, operator decides          │ │
//! │  │                                                                   │ │
//! │  │  one loyalty_reconciliations row per customer, every time         │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │        │                                                                │
//! │        ▼  ReconciliationSummary (counts by action)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A fetch failure for one customer never stops the pass. The engine has
//! its own single-flight guard, independent of the sync processor's.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReconciliationSettings;
use crate::crm::CrmClient;
use crate::error::{SyncError, SyncResult};
use crate::guard::SingleFlight;
use tally_core::drift::{self, DriftThresholds};
use tally_core::{Customer, LoyaltyReconciliation, ReconciliationAction, ReconciliationSummary};
use tally_db::Database;

/// Result of reconciling one business.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessReconciliation {
    pub business_id: String,
    pub summary: ReconciliationSummary,
}

/// Periodic comparator of POS and CRM loyalty balances.
pub struct ReconciliationEngine {
    db: Database,
    crm: CrmClient,
    settings: ReconciliationSettings,
    thresholds: DriftThresholds,
    flight: SingleFlight,
}

impl ReconciliationEngine {
    pub fn new(db: Database, crm: CrmClient, settings: ReconciliationSettings) -> Self {
        ReconciliationEngine {
            thresholds: settings.thresholds(),
            db,
            crm,
            settings,
            flight: SingleFlight::new("Loyalty reconciliation"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    // =========================================================================
    // Timer
    // =========================================================================

    /// Runs full passes on the configured interval until shutdown. The first
    /// pass happens one interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let period = self.settings.interval();
        info!(interval_secs = self.settings.interval_secs, "Reconciliation engine starting");

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(_guard) = self.flight.try_acquire() else {
                        debug!("Reconciliation already running, tick dropped");
                        continue;
                    };
                    if let Err(e) = self.pass_all().await {
                        error!(error = %e, "Scheduled reconciliation failed");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Reconciliation engine shutting down");
                    break;
                }
            }
        }

        info!("Reconciliation engine stopped");
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Reconciles every business mapped to a CRM tenant.
    ///
    /// ## Errors
    /// `AlreadyRunning` when a pass is in flight.
    pub async fn reconcile_all(&self) -> SyncResult<Vec<BusinessReconciliation>> {
        let _guard = self
            .flight
            .try_acquire()
            .ok_or(SyncError::AlreadyRunning(self.flight.name()))?;
        self.pass_all().await
    }

    /// Reconciles one business.
    ///
    /// ## Errors
    /// `AlreadyRunning` when a pass is in flight, `TenantUnmapped` when the
    /// business has no CRM tenant.
    pub async fn reconcile_business(&self, business_id: &str) -> SyncResult<BusinessReconciliation> {
        let _guard = self
            .flight
            .try_acquire()
            .ok_or(SyncError::AlreadyRunning(self.flight.name()))?;
        self.pass_business(business_id).await
    }

    /// On-demand reconciliation of a single customer. Not guarded: it
    /// touches one row and may run next to a full pass.
    pub async fn reconcile_customer(&self, customer_id: &str) -> SyncResult<LoyaltyReconciliation> {
        let customer = self
            .db
            .customers()
            .get(customer_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Customer", customer_id))?;

        if customer.is_anonymous {
            return Err(SyncError::Validation(
                "anonymous customers are not reconciled".into(),
            ));
        }
        if customer.external_id.is_none() {
            return Err(SyncError::Validation(format!(
                "customer {customer_id} has never been synced to the CRM"
            )));
        }

        let (_, tenant) = self.crm.resolve_tenant(&customer.business_id).await?;
        self.evaluate(&tenant, &customer).await
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Counts by action over the last `since_days` days, plus the open
    /// review queue.
    pub async fn summary(
        &self,
        business_id: &str,
        since_days: i64,
    ) -> SyncResult<ReconciliationSummary> {
        let since = Utc::now() - Duration::days(since_days);
        Ok(self
            .db
            .reconciliations()
            .summary(business_id, since)
            .await?)
    }

    /// The operator queue.
    pub async fn pending_reviews(
        &self,
        business_id: &str,
        limit: i64,
    ) -> SyncResult<Vec<LoyaltyReconciliation>> {
        Ok(self
            .db
            .reconciliations()
            .pending_reviews(business_id, limit)
            .await?)
    }

    /// Operator sign-off on a PENDING record.
    pub async fn resolve_review(
        &self,
        record_id: &str,
        notes: Option<&str>,
    ) -> SyncResult<LoyaltyReconciliation> {
        Ok(self
            .db
            .reconciliations()
            .resolve(record_id, notes, Utc::now())
            .await?)
    }

    // =========================================================================
    // Passes
    // =========================================================================

    async fn pass_all(&self) -> SyncResult<Vec<BusinessReconciliation>> {
        let businesses = self.db.businesses().list_mapped().await?;
        let mut results = Vec::with_capacity(businesses.len());

        for business in businesses {
            match self.pass_business(&business.id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(business_id = %business.id, error = %e, "Business reconciliation failed");
                }
            }
        }

        info!(businesses = results.len(), "Reconciliation pass complete");
        Ok(results)
    }

    async fn pass_business(&self, business_id: &str) -> SyncResult<BusinessReconciliation> {
        let (_, tenant) = self.crm.resolve_tenant(business_id).await?;
        let customers = self.db.customers().list_reconcilable(business_id).await?;

        let mut summary = ReconciliationSummary::default();
        for customer in &customers {
            match self.evaluate(&tenant, customer).await {
                Ok(record) => summary.add(record.action, 1),
                Err(e) => {
                    error!(
                        customer_id = %customer.id,
                        error = %e,
                        "Failed to record reconciliation"
                    );
                }
            }
        }
        summary.pending_reviews = summary.manual_review;

        info!(
            business_id = %business_id,
            total = summary.total,
            none = summary.none,
            auto_sync = summary.auto_sync,
            sync_with_log = summary.sync_with_log,
            manual_review = summary.manual_review,
            failed = summary.failed,
            "Business reconciled"
        );

        Ok(BusinessReconciliation {
            business_id: business_id.to_string(),
            summary,
        })
    }

    /// Compares, applies and records one customer.
    async fn evaluate(&self, tenant: &str, customer: &Customer) -> SyncResult<LoyaltyReconciliation> {
        let remote_id = customer
            .external_id
            .as_deref()
            .ok_or_else(|| SyncError::Validation("customer has no CRM id".into()))?;

        let mut decision = match self.crm.fetch_customer(tenant, remote_id).await {
            Ok(remote) => self
                .thresholds
                .classify(customer.loyalty_points, remote.loyalty_points),
            Err(e) => {
                warn!(customer_id = %customer.id, error = %e, "Could not fetch CRM balance");
                drift::fetch_failed(customer.loyalty_points, &e.to_string())
            }
        };

        let now = Utc::now();
        if let Some(points) = decision.new_local_points {
            if let Err(e) = self
                .db
                .customers()
                .update_loyalty_points(&customer.id, points, now)
                .await
            {
                error!(customer_id = %customer.id, error = %e, "Could not apply CRM balance");
                decision = drift::apply_failed(&decision, &e.to_string());
            }
        }

        match decision.action {
            ReconciliationAction::None => {}
            ReconciliationAction::AutoSync => debug!(
                customer_id = %customer.id,
                discrepancy = decision.discrepancy,
                "Points auto-synced"
            ),
            ReconciliationAction::SyncWithLog => info!(
                customer_id = %customer.id,
                pos_points = decision.pos_points,
                crm_points = decision.crm_points,
                discrepancy = decision.discrepancy,
                "Points synced with audit note"
            ),
            ReconciliationAction::ManualReview => warn!(
                customer_id = %customer.id,
                pos_points = decision.pos_points,
                crm_points = decision.crm_points,
                discrepancy = decision.discrepancy,
                "Points drift needs manual review"
            ),
            ReconciliationAction::Failed => {}
        }

        Ok(self
            .db
            .reconciliations()
            .insert(&customer.business_id, &customer.id, &decision, now)
            .await?)
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("thresholds", &self.thresholds)
            .field("running", &self.flight.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tally_db::{DbConfig, NewCustomer};

    use super::*;
    use crate::config::CrmSettings;

    async fn setup() -> (Database, ReconciliationEngine, String) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let business = db.businesses().insert("Shop", Some("tenant-a")).await.unwrap();
        let crm_settings = CrmSettings {
            base_url: "http://127.0.0.1:9".into(),
            integration_secret: "secret".into(),
            ..Default::default()
        };
        let crm = CrmClient::new(&crm_settings, db.clone()).unwrap();
        let engine = ReconciliationEngine::new(db.clone(), crm, ReconciliationSettings::default());
        (db, engine, business.id)
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_in_flight() {
        let (_db, engine, biz) = setup().await;

        let _held = engine.flight.try_acquire().unwrap();
        assert!(matches!(
            engine.reconcile_business(&biz).await,
            Err(SyncError::AlreadyRunning(_))
        ));
        assert!(matches!(
            engine.reconcile_all().await,
            Err(SyncError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_unsynced_and_anonymous_customers_rejected() {
        let (db, engine, biz) = setup().await;

        let anon = db.customers().insert(&NewCustomer::anonymous(&biz)).await.unwrap();
        assert!(matches!(
            engine.reconcile_customer(&anon.id).await,
            Err(SyncError::Validation(_))
        ));

        let fresh = db
            .customers()
            .insert(&NewCustomer::new(&biz, "Ada", "Lovelace"))
            .await
            .unwrap();
        assert!(matches!(
            engine.reconcile_customer(&fresh.id).await,
            Err(SyncError::Validation(_))
        ));

        assert!(matches!(
            engine.reconcile_customer("missing").await,
            Err(SyncError::EntityNotFound { .. })
        ));
    }
}
