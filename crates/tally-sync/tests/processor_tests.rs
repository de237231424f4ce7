mod common;

use chrono::{Duration, Utc};
use common::{fast_settings, Harness, TENANT};
use serde_json::json;
use tally_core::{
    CustomerSyncState, EntityType, QueueStatus, SyncLogStatus, SyncOperation, SyncPriority,
};
use tally_db::{NewCustomer, NewTransaction};
use tally_sync::{Enqueuer, ProcessorSettings, SyncLogRetryJob};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, ResponseTemplate};

async fn mount_ok(h: &Harness, route: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&h.crm_server)
        .await;
}

async fn make_due(h: &Harness, item_id: &str) {
    sqlx::query("UPDATE sync_queue SET scheduled_for = ?1 WHERE id = ?2")
        .bind(Utc::now() - Duration::seconds(1))
        .bind(item_id)
        .execute(h.db.pool())
        .await
        .unwrap();
}

async fn transaction_for(h: &Harness, customer_id: Option<String>) -> String {
    h.db
        .transactions()
        .insert(
            &NewTransaction::new(&h.business_id, format!("T-{}", uuid::Uuid::new_v4()), customer_id, 2_500),
            &[],
        )
        .await
        .unwrap()
        .id
}

// ── Enqueue ─────────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_twice_yields_one_active_item() {
    let h = Harness::new().await;
    let enqueuer = Enqueuer::new(h.db.clone());
    let customer_id = h.customer("Ada").await;

    let first = enqueuer
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();
    let second = enqueuer
        .customer(&h.business_id, &customer_id, SyncOperation::Update, SyncPriority::High)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.db.queue().stats(None).await.unwrap().total, 1);
}

// ── Dependency ordering ─────────────────────────────────────────

#[tokio::test]
async fn customer_is_sent_before_its_transaction() {
    let h = Harness::new().await;
    mount_ok(&h, "/sync/customer", json!({ "customer": { "id": "crm-77" } })).await;
    mount_ok(&h, "/sync/transaction", json!({ "success": true })).await;

    let enqueuer = Enqueuer::new(h.db.clone());
    let customer_id = h.customer("Grace").await;
    let txn_id = transaction_for(&h, Some(customer_id.clone())).await;

    // Transaction first in wall-clock order; dispatch order must still put
    // the customer ahead of it.
    enqueuer.transaction(&h.business_id, &txn_id).await.unwrap();
    enqueuer
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();

    let report = h.processor(fast_settings()).trigger_now().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.deferred, 0);

    let requests = h.crm_server.received_requests().await.unwrap();
    let paths: Vec<_> = requests.iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(paths, vec!["/sync/customer", "/sync/transaction"]);

    let customer = h.db.customers().get(&customer_id).await.unwrap().unwrap();
    assert_eq!(customer.external_id.as_deref(), Some("crm-77"));
    assert_eq!(customer.sync_state, CustomerSyncState::Synced);

    let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(body["customerId"], "crm-77");
    assert_eq!(body["total"], "25.00");
}

#[tokio::test]
async fn transaction_waits_for_unsynced_customer() {
    let h = Harness::new().await;
    mount_ok(&h, "/sync/customer", json!({ "customer": { "id": "crm-5" } })).await;
    mount_ok(&h, "/sync/transaction", json!({ "success": true })).await;

    let customer_id = h.customer("Linus").await;
    let txn_id = transaction_for(&h, Some(customer_id.clone())).await;
    let txn_item = Enqueuer::new(h.db.clone())
        .transaction(&h.business_id, &txn_id)
        .await
        .unwrap();

    let processor = h.processor(ProcessorSettings {
        dependency_wait_secs: 0,
        ..fast_settings()
    });

    // First cycle: no call for the transaction, customer queued HIGH.
    let report = processor.trigger_now().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert!(h.crm_server.received_requests().await.unwrap().is_empty());

    let deferred = h.db.queue().get(&txn_item.id).await.unwrap().unwrap();
    assert_eq!(deferred.status, QueueStatus::Retry);
    assert_eq!(deferred.retry_count, 0);

    let customer_item = h
        .db
        .queue()
        .find_active(EntityType::Customer, &customer_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer_item.priority, SyncPriority::High);
    assert_eq!(customer_item.operation, SyncOperation::Create);

    // Second cycle: customer then transaction.
    let report = processor.trigger_now().await.unwrap();
    assert_eq!(report.succeeded, 2);

    let paths: Vec<_> = h
        .crm_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/sync/customer", "/sync/transaction"]);

    let done = h.db.queue().get(&txn_item.id).await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Success);
    assert_eq!(done.retry_count, 0);
}

#[tokio::test]
async fn failed_customer_is_not_requeued_by_its_transaction() {
    let h = Harness::new().await;
    let rejection = Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(422).set_body_string("email invalid"))
        .expect(1)
        .mount_as_scoped(&h.crm_server)
        .await;

    let customer_id = h.customer("Radia").await;
    let txn_id = transaction_for(&h, Some(customer_id.clone())).await;
    let txn_item = Enqueuer::new(h.db.clone())
        .transaction(&h.business_id, &txn_id)
        .await
        .unwrap();

    let processor = h.processor(ProcessorSettings {
        dependency_wait_secs: 0,
        ..fast_settings()
    });
    for _ in 0..6 {
        processor.trigger_now().await.unwrap();
    }

    let customer_items = h
        .db
        .queue()
        .history_for_entity(EntityType::Customer, &customer_id)
        .await
        .unwrap();
    assert_eq!(customer_items.len(), 1);
    assert_eq!(customer_items[0].status, QueueStatus::Failed);

    let blocked = h.db.queue().get(&txn_item.id).await.unwrap().unwrap();
    assert_eq!(blocked.status, QueueStatus::Failed);
    assert_eq!(blocked.retry_count, 1);
    assert!(blocked.last_error.as_deref().unwrap().contains("failed to sync"));
    drop(rejection);

    // A manual reset sends the customer, then the transaction.
    mount_ok(&h, "/sync/customer", json!({ "customer": { "id": "crm-12" } })).await;
    mount_ok(&h, "/sync/transaction", json!({ "success": true })).await;
    assert_eq!(
        h.db
            .queue()
            .reset_failed(Some(&h.business_id), Utc::now())
            .await
            .unwrap(),
        2
    );

    let report = processor.trigger_now().await.unwrap();
    assert_eq!(report.succeeded, 2);
    let done = h.db.queue().get(&txn_item.id).await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Success);
    let customer = h.db.customers().get(&customer_id).await.unwrap().unwrap();
    assert_eq!(customer.sync_state, CustomerSyncState::Synced);
}

// ── Retry & backoff ─────────────────────────────────────────────

#[tokio::test]
async fn backoff_doubles_then_fails_permanently() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(4)
        .mount(&h.crm_server)
        .await;

    let customer_id = h.customer("Barbara").await;
    let item = Enqueuer::new(h.db.clone())
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();
    let processor = h.processor(fast_settings());

    for (expected_count, expected_minutes) in [(1, 1), (2, 2), (3, 4)] {
        let before = Utc::now();
        let report = processor.trigger_now().await.unwrap();
        assert_eq!(report.retried, 1);

        let current = h.db.queue().get(&item.id).await.unwrap().unwrap();
        assert_eq!(current.status, QueueStatus::Retry);
        assert_eq!(current.retry_count, expected_count);
        assert!(current.last_error.as_deref().unwrap().contains("503"));

        let delay = current.scheduled_for - before;
        assert!(delay >= Duration::minutes(expected_minutes) - Duration::seconds(1));
        assert!(delay <= Duration::minutes(expected_minutes) + Duration::seconds(5));

        make_due(&h, &item.id).await;
    }

    let report = processor.trigger_now().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = h.db.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.retry_count, 4);

    let customer = h.db.customers().get(&customer_id).await.unwrap().unwrap();
    assert_eq!(customer.sync_state, CustomerSyncState::Failed);

    let ledger = h
        .db
        .sync_logs()
        .list_for_entity(EntityType::Customer, &customer_id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 4);
    assert!(ledger.iter().all(|e| e.status == SyncLogStatus::Failed));
    assert!(ledger.iter().all(|e| e.http_status == Some(503)));
}

#[tokio::test]
async fn client_error_fails_without_retry() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(422).set_body_string("email invalid"))
        .expect(1)
        .mount(&h.crm_server)
        .await;

    let customer_id = h.customer("Edsger").await;
    let item = Enqueuer::new(h.db.clone())
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();

    let report = h.processor(fast_settings()).trigger_now().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = h.db.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.retry_count, 1);
}

#[tokio::test]
async fn outbound_calls_carry_tenant_and_bearer() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .and(header("X-Tenant-ID", TENANT))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 9001 })))
        .expect(1)
        .mount(&h.crm_server)
        .await;

    let customer_id = h.customer("Alan").await;
    Enqueuer::new(h.db.clone())
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::High)
        .await
        .unwrap();

    let report = h.processor(fast_settings()).trigger_now().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let customer = h.db.customers().get(&customer_id).await.unwrap().unwrap();
    assert_eq!(customer.external_id.as_deref(), Some("9001"));
}

// ── Recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn stuck_items_are_recovered_and_redispatched() {
    let h = Harness::new().await;
    mount_ok(&h, "/sync/customer", json!({ "customer": { "id": "crm-1" } })).await;

    let customer_id = h.customer("Margaret").await;
    let item = Enqueuer::new(h.db.clone())
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();

    // A crash mid-dispatch an hour ago.
    assert!(h
        .db
        .queue()
        .mark_processing(&item.id, Utc::now() - Duration::hours(1))
        .await
        .unwrap());

    let report = h.processor(fast_settings()).trigger_now().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.succeeded, 1);

    let done = h.db.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Success);
}

#[tokio::test]
async fn fresh_processing_items_are_left_alone() {
    let h = Harness::new().await;
    let customer_id = h.customer("Donald").await;
    let item = Enqueuer::new(h.db.clone())
        .customer(&h.business_id, &customer_id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();
    h.db.queue().mark_processing(&item.id, Utc::now()).await.unwrap();

    let report = h.processor(fast_settings()).trigger_now().await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.processed, 0);

    let current = h.db.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(current.status, QueueStatus::Processing);
}

// ── Anonymous & walk-in ─────────────────────────────────────────

#[tokio::test]
async fn anonymous_customer_traffic_never_reaches_crm() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.crm_server)
        .await;

    let anon = h
        .db
        .customers()
        .insert(&NewCustomer::anonymous(&h.business_id))
        .await
        .unwrap();
    let txn_id = transaction_for(&h, Some(anon.id.clone())).await;
    let walk_in = transaction_for(&h, None).await;

    let enqueuer = Enqueuer::new(h.db.clone());
    enqueuer
        .customer(&h.business_id, &anon.id, SyncOperation::Create, SyncPriority::Normal)
        .await
        .unwrap();
    enqueuer.transaction(&h.business_id, &txn_id).await.unwrap();
    enqueuer.transaction(&h.business_id, &walk_in).await.unwrap();

    let report = h.processor(fast_settings()).trigger_now().await.unwrap();
    assert_eq!(report.skipped, 3);
    assert_eq!(report.failed, 0);

    let stats = h.db.queue().stats(None).await.unwrap();
    assert_eq!(stats.success, 3);
}

// ── Sync log retry ──────────────────────────────────────────────

#[tokio::test]
async fn log_retry_resolves_rows_without_new_ledger_entries() {
    let h = Harness::new().await;

    // First the CRM is down.
    let outage = Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(500))
        .mount_as_scoped(&h.crm_server)
        .await;

    let customer_id = h.customer("Frances").await;
    assert!(h
        .crm
        .sync_customer(&h.business_id, &customer_id, SyncOperation::Create)
        .await
        .is_err());
    drop(outage);

    mount_ok(&h, "/sync/customer", json!({ "customer": { "id": "crm-8" } })).await;

    let processor = h.processor(fast_settings());
    let job = SyncLogRetryJob::new(h.db.clone(), h.crm.clone(), processor.scheduler().clone());
    let report = job.run(3).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);

    let ledger = h
        .db
        .sync_logs()
        .list_for_entity(EntityType::Customer, &customer_id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 1);
    assert!(ledger[0].resolved_at.is_some());

    // Nothing left to do.
    assert_eq!(job.run(3).await.unwrap().attempted, 0);
}

#[tokio::test]
async fn log_retry_skips_work_the_queue_already_delivered() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/sync/transaction"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&h.crm_server)
        .await;
    mount_ok(&h, "/sync/transaction", json!({ "success": true })).await;

    let customer_id = h.synced_customer("Mary", "crm-21", 0).await;
    let txn_id = transaction_for(&h, Some(customer_id)).await;
    let item = Enqueuer::new(h.db.clone())
        .transaction(&h.business_id, &txn_id)
        .await
        .unwrap();

    let processor = h.processor(fast_settings());
    assert_eq!(processor.trigger_now().await.unwrap().retried, 1);
    make_due(&h, &item.id).await;
    assert_eq!(processor.trigger_now().await.unwrap().succeeded, 1);

    let ledger = h
        .db
        .sync_logs()
        .list_for_entity(EntityType::Transaction, &txn_id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 2);
    assert!(ledger
        .iter()
        .filter(|row| row.status == SyncLogStatus::Failed)
        .all(|row| row.resolved_at.is_some()));

    let job = SyncLogRetryJob::new(h.db.clone(), h.crm.clone(), processor.scheduler().clone());
    assert_eq!(job.run(3).await.unwrap().attempted, 0);
    assert_eq!(h.crm_server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn log_retry_sends_once_per_entity() {
    let h = Harness::new().await;
    let outage = Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(500))
        .mount_as_scoped(&h.crm_server)
        .await;

    let customer_id = h.customer("Annie").await;
    for _ in 0..3 {
        assert!(h
            .crm
            .sync_customer(&h.business_id, &customer_id, SyncOperation::Create)
            .await
            .is_err());
    }
    drop(outage);

    Mock::given(method("POST"))
        .and(path("/sync/customer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "crm-30" })))
        .expect(1)
        .mount(&h.crm_server)
        .await;

    let processor = h.processor(fast_settings());
    let job = SyncLogRetryJob::new(h.db.clone(), h.crm.clone(), processor.scheduler().clone());
    let report = job.run(3).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);

    let ledger = h
        .db
        .sync_logs()
        .list_for_entity(EntityType::Customer, &customer_id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 3);
    assert!(ledger.iter().all(|row| row.resolved_at.is_some()));
}
