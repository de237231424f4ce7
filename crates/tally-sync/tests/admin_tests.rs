mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{fast_settings, Harness};
use serde_json::{json, Value};
use tally_core::{QueueStatus, SyncOperation, SyncPriority};
use tally_sync::http::admin;
use tally_sync::{
    AdminState, Enqueuer, ReconciliationEngine, ReconciliationSettings, SyncLogRetryJob,
    SyncProcessor,
};
use tower::ServiceExt;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, ResponseTemplate};

struct AdminHarness {
    h: Harness,
    processor: Arc<SyncProcessor>,
    reconciliation: Arc<ReconciliationEngine>,
}

impl AdminHarness {
    async fn new() -> Self {
        let h = Harness::new().await;
        let processor = Arc::new(h.processor(fast_settings()));
        let reconciliation = Arc::new(ReconciliationEngine::new(
            h.db.clone(),
            h.crm.clone(),
            ReconciliationSettings::default(),
        ));
        AdminHarness {
            h,
            processor,
            reconciliation,
        }
    }

    fn app(&self) -> Router {
        admin::router(AdminState {
            db: self.h.db.clone(),
            crm: self.h.crm.clone(),
            processor: self.processor.clone(),
            reconciliation: self.reconciliation.clone(),
            log_retry: SyncLogRetryJob::new(
                self.h.db.clone(),
                self.h.crm.clone(),
                self.processor.scheduler().clone(),
            ),
            max_attempts: 3,
        })
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .app()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}

#[tokio::test]
async fn manual_run_reports_cycle() {
    let a = AdminHarness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "crm-1" })))
        .mount(&a.h.crm_server)
        .await;

    let customer_id = a.h.customer("Ada").await;
    Enqueuer::new(a.h.db.clone())
        .customer(&a.h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();

    let (status, body) = a.call("POST", "/admin/sync/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["succeeded"], 1);

    let (status, body) = a.call("GET", "/admin/sync/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processor"]["isRunning"], false);
    assert_eq!(body["processor"]["lastReport"]["succeeded"], 1);
    assert_eq!(body["queue"]["success"], 1);
}

#[tokio::test]
async fn overlapping_sync_run_is_conflict() {
    let a = AdminHarness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "crm-1" }))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&a.h.crm_server)
        .await;

    let customer_id = a.h.customer("Grace").await;
    Enqueuer::new(a.h.db.clone())
        .customer(&a.h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();

    let processor = a.processor.clone();
    let running = tokio::spawn(async move { processor.trigger_now().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, body) = a.call("POST", "/admin/sync/run", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_running");

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn overlapping_reconciliation_is_conflict() {
    let a = AdminHarness::new().await;
    a.h.synced_customer("Linus", "crm-9", 10).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/customers/.+$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "loyaltyPoints": 10 }))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&a.h.crm_server)
        .await;

    let engine = a.reconciliation.clone();
    let running = tokio::spawn(async move { engine.reconcile_all().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, _) = a
        .call(
            "POST",
            "/admin/reconciliation/run",
            Some(json!({ "businessId": a.h.business_id })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(running.await.unwrap().unwrap().len(), 1);

    // Guard released: a new run goes through.
    let (status, body) = a.call("POST", "/admin/reconciliation/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["summary"]["none"], 1);
}

#[tokio::test]
async fn retry_failed_resets_terminal_items() {
    let a = AdminHarness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&a.h.crm_server)
        .await;

    let customer_id = a.h.customer("Hedy").await;
    let item = Enqueuer::new(a.h.db.clone())
        .customer(&a.h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();
    a.processor.trigger_now().await.unwrap();
    assert_eq!(
        a.h.db.queue().get(&item.id).await.unwrap().unwrap().status,
        QueueStatus::Failed
    );

    let (status, body) = a.call("POST", "/admin/sync/retry-failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], 1);

    let reset = a.h.db.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(reset.status, QueueStatus::Pending);
    assert_eq!(reset.retry_count, 0);
}

#[tokio::test]
async fn review_queue_round_trip() {
    let a = AdminHarness::new().await;
    let customer_id = a.h.synced_customer("Ida", "crm-7", 900).await;
    Mock::given(method("GET"))
        .and(path("/customers/crm-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "loyalty_points": "100" })))
        .mount(&a.h.crm_server)
        .await;

    let (status, record) = a
        .call(
            "POST",
            &format!("/admin/reconciliation/customers/{customer_id}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["action"], "MANUAL_REVIEW");

    let uri = format!(
        "/admin/reconciliation/reviews?businessId={}",
        a.h.business_id
    );
    let (_, reviews) = a.call("GET", &uri, None).await;
    assert_eq!(reviews.as_array().unwrap().len(), 1);

    let record_id = record["id"].as_str().unwrap();
    let (status, resolved) = a
        .call(
            "POST",
            &format!("/admin/reconciliation/reviews/{record_id}/resolve"),
            Some(json!({ "notes": "checked paper ledger" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "RESOLVED");

    let uri = format!(
        "/admin/reconciliation/summary?businessId={}&days=7",
        a.h.business_id
    );
    let (_, summary) = a.call("GET", &uri, None).await;
    assert_eq!(summary["manualReview"], 1);
    assert_eq!(summary["pendingReviews"], 0);
}

#[tokio::test]
async fn unknown_customer_reconciliation_is_not_found() {
    let a = AdminHarness::new().await;
    let (status, body) = a
        .call("POST", "/admin/reconciliation/customers/missing", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn health_reports_both_sides() {
    let a = AdminHarness::new().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&a.h.crm_server)
        .await;

    let (status, body) = a.call("GET", "/admin/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "database": true, "crm": true }));
}
