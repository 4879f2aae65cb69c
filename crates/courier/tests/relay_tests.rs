//! Relay behavior tests: the full claim → publish → finalize cycle,
//! lease recovery, fencing, redrive, backpressure and health, driven
//! through the public API against the in-memory ports.

use std::sync::Arc;
use std::time::Duration;

use courier_testing::{InMemoryInboxStore, InMemoryOutboxRepository, ScriptedPublisher};
use serde_json::json;
use uuid::Uuid;

use courier_core::{
    Admission, BacklogLimiter, BacklogPolicy, EventStatus, Handled, HealthMonitor, HealthStatus,
    HealthThresholds, IdempotentExecutor, InboxStore, NewEvent, OutboxError, OutboxEvent,
    OutboxRepository, OverflowAction, Reaper, RecentQuery, RelayConfig, RelayWorker, RetryPolicy,
};

fn fast_config() -> RelayConfig {
    RelayConfig {
        batch_size: 10,
        poll_interval: Duration::from_millis(10),
        concurrency: 4,
        lease: Duration::from_millis(900),
        heartbeat_interval: Duration::from_millis(300),
        max_retries: 5,
        retry_policy: RetryPolicy {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter_factor: 0.0,
        },
        reaper_enabled: false,
        reaper_interval: Duration::from_millis(450),
        shutdown_grace: Duration::from_millis(900),
    }
}

fn order_event() -> NewEvent {
    NewEvent::new("order", "order-1", "OrderCreated", json!({"id": 1}))
}

async fn wait_for_status(
    repo: &InMemoryOutboxRepository,
    id: i64,
    status: EventStatus,
) -> OutboxEvent {
    for _ in 0..600 {
        if let Some(row) = repo.get(id) {
            if row.status == status {
                return row;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("event {id} never reached {status}");
}

// ============================================================================
// End-to-end relay scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_completes_event() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let inserted = repo.insert(order_event()).await.unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();

    let row = wait_for_status(&repo, inserted.id, EventStatus::Completed).await;
    handle.shutdown().await;

    assert_eq!(row.retry_count, 0);
    assert!(row.processed_at.is_some());
    assert!(row.locked_until.is_none());
    assert!(row.lock_token.is_none());
    assert_eq!(publisher.published(), vec![inserted.tracking_id]);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_retry_then_succeed() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::with_script(vec![
        Err(courier_core::PublishError::Transient("timeout".into())),
        Err(courier_core::PublishError::Transient("timeout".into())),
        Ok(()),
    ]));
    let inserted = repo
        .insert(order_event().with_max_retries(3))
        .await
        .unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();

    let row = wait_for_status(&repo, inserted.id, EventStatus::Completed).await;
    handle.shutdown().await;

    assert_eq!(row.retry_count, 2);
    assert_eq!(publisher.publish_count(), 3);
    // The last failure reason stays visible after the eventual success.
    assert_eq!(row.last_error.as_deref(), Some("timeout"));
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_dead_letter() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_failing(
        courier_core::PublishError::Transient("schema invalid".into()),
    ));
    let inserted = repo
        .insert(order_event().with_max_retries(2))
        .await
        .unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();

    let row = wait_for_status(&repo, inserted.id, EventStatus::DeadLetter).await;
    handle.shutdown().await;

    assert_eq!(row.retry_count, 2);
    assert_eq!(row.last_error.as_deref(), Some("schema invalid"));
    assert!(row.processed_at.is_some());
    assert_eq!(publisher.publish_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_failure_dead_letters_without_retry() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_failing(
        courier_core::PublishError::Permanent("unknown destination".into()),
    ));
    let inserted = repo.insert(order_event()).await.unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();

    let row = wait_for_status(&repo, inserted.id, EventStatus::DeadLetter).await;
    handle.shutdown().await;

    assert_eq!(publisher.publish_count(), 1);
    assert_eq!(row.last_error.as_deref(), Some("unknown destination"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reaper_recovers_abandoned_lease() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let inserted = repo.insert(order_event()).await.unwrap();

    // Worker A claims and dies: no heartbeat, no finalize.
    let token_a = courier_core::next_lock_token();
    let claimed = repo
        .claim_batch(10, Duration::from_millis(50), token_a)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    repo.expire_lease(inserted.id);

    let reaper = Reaper::new(repo.clone(), Duration::from_millis(10));
    assert_eq!(reaper.sweep().await.unwrap(), 1);

    let row = repo.get(inserted.id).unwrap();
    assert_eq!(row.status, EventStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert!(row.locked_until.is_none());
    assert!(row.lock_token.is_none());

    // Worker B picks it up and completes.
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();
    let row = wait_for_status(&repo, inserted.id, EventStatus::Completed).await;
    handle.shutdown().await;
    assert_eq!(row.retry_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_keeps_slow_publish_alive() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    // Publish takes longer than two full leases; only renewals keep the
    // reaper away. A single publish call proves the lease never lapsed.
    publisher.set_delay(Duration::from_millis(700));
    let inserted = repo.insert(order_event()).await.unwrap();

    let config = RelayConfig {
        lease: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(100),
        reaper_enabled: true,
        reaper_interval: Duration::from_millis(150),
        shutdown_grace: Duration::from_millis(300),
        ..fast_config()
    };
    let worker = RelayWorker::new(repo.clone(), publisher.clone(), config).unwrap();
    let handle = worker.spawn();

    let row = wait_for_status(&repo, inserted.id, EventStatus::Completed).await;
    handle.shutdown().await;
    assert_eq!(publisher.publish_count(), 1);
    assert_eq!(row.retry_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_lease_mid_flight_is_abandoned() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    publisher.set_delay(Duration::from_millis(400));
    let inserted = repo.insert(order_event()).await.unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();

    // Wait until the publish is in flight, then steal the lease the way
    // a reap-plus-reclaim by another process would.
    for _ in 0..200 {
        if publisher.publish_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(publisher.publish_count(), 1);
    repo.expire_lease(inserted.id);
    assert_eq!(repo.recover_stale().await.unwrap(), 1);
    let thief = courier_core::next_lock_token();
    let stolen = repo.claim_batch(1, Duration::from_secs(60), thief).await.unwrap();
    assert_eq!(stolen.len(), 1);

    // The first worker's publish resolves, its heartbeat has flagged the
    // loss (or its finalize is fenced), and the row stays with the thief.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let row = repo.get(inserted.id).unwrap();
    assert_eq!(row.status, EventStatus::Processing);
    assert_eq!(row.lock_token, Some(thief));

    assert!(repo.mark_completed(inserted.id, thief).await.unwrap());
    handle.shutdown().await;
    assert_eq!(
        repo.get(inserted.id).unwrap().status,
        EventStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_lets_in_flight_events_finish() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    publisher.set_delay(Duration::from_millis(200));
    let inserted = repo.insert(order_event()).await.unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();
    for _ in 0..200 {
        if publisher.publish_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.shutdown().await;

    let row = repo.get(inserted.id).unwrap();
    assert_eq!(row.status, EventStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_survives_database_outage() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::always_ok());

    repo.set_unavailable(true);
    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();
    // Several failed claim iterations.
    tokio::time::sleep(Duration::from_millis(100)).await;

    repo.set_unavailable(false);
    let inserted = repo.insert(order_event()).await.unwrap();
    let row = wait_for_status(&repo, inserted.id, EventStatus::Completed).await;
    handle.shutdown().await;
    assert_eq!(row.status, EventStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn redriven_dead_letter_gets_reprocessed() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(ScriptedPublisher::with_script(vec![Err(
        courier_core::PublishError::Permanent("downstream missing".into()),
    )]));
    let inserted = repo.insert(order_event()).await.unwrap();

    let worker = RelayWorker::new(repo.clone(), publisher.clone(), fast_config()).unwrap();
    let handle = worker.spawn();
    wait_for_status(&repo, inserted.id, EventStatus::DeadLetter).await;

    // Operator fixes the destination and redrives the type.
    assert_eq!(repo.redrive_by_event_type("OrderCreated").await.unwrap(), 1);
    let row = repo.get(inserted.id).unwrap();
    assert_eq!(row.retry_count, 0);
    assert!(row.last_error.is_none());

    let row = wait_for_status(&repo, inserted.id, EventStatus::Completed).await;
    handle.shutdown().await;
    assert_eq!(row.retry_count, 0);
    assert_eq!(publisher.publish_count(), 2);
}

// ============================================================================
// Repository-level properties
// ============================================================================

#[tokio::test]
async fn fencing_blocks_stale_worker() {
    let repo = InMemoryOutboxRepository::new();
    let inserted = repo.insert(order_event()).await.unwrap();

    let alpha = courier_core::next_lock_token();
    let claimed = repo.claim_batch(1, Duration::from_millis(50), alpha).await.unwrap();
    assert_eq!(claimed.len(), 1);

    repo.expire_lease(inserted.id);
    let beta = courier_core::next_lock_token();
    let claimed = repo.claim_batch(1, Duration::from_secs(60), beta).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].lock_token, Some(beta));

    // The stale worker's finalize affects zero rows.
    assert!(!repo.mark_completed(inserted.id, alpha).await.unwrap());
    assert!(!repo.mark_failed(inserted.id, alpha, "late", None).await.unwrap());
    assert!(!repo.mark_dead_letter(inserted.id, alpha, "late").await.unwrap());
    assert!(!repo.renew_lease(inserted.id, alpha, Duration::from_secs(60)).await.unwrap());

    let row = repo.get(inserted.id).unwrap();
    assert_eq!(row.status, EventStatus::Processing);
    assert_eq!(row.lock_token, Some(beta));

    assert!(repo.mark_completed(inserted.id, beta).await.unwrap());
    // Replaying the finalize after the lease is cleared is a no-op.
    assert!(!repo.mark_completed(inserted.id, beta).await.unwrap());
}

#[tokio::test]
async fn claim_batch_orders_by_created_at_and_skips_locked() {
    let repo = InMemoryOutboxRepository::new();
    let mut ids = Vec::new();
    for n in 0..5 {
        let inserted = repo
            .insert(NewEvent::new("order", format!("order-{n}"), "OrderCreated", json!({"n": n})))
            .await
            .unwrap();
        ids.push(inserted.id);
    }

    let first = courier_core::next_lock_token();
    let batch = repo.claim_batch(3, Duration::from_secs(60), first).await.unwrap();
    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), &ids[..3]);
    assert!(batch.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    // A concurrent claimer skips the locked rows instead of waiting.
    let second = courier_core::next_lock_token();
    let batch = repo.claim_batch(10, Duration::from_secs(60), second).await.unwrap();
    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), &ids[3..]);
}

#[tokio::test]
async fn failed_event_stays_invisible_until_retry_at() {
    let repo = InMemoryOutboxRepository::new();
    let inserted = repo.insert(order_event()).await.unwrap();

    let token = courier_core::next_lock_token();
    repo.claim_batch(1, Duration::from_secs(60), token).await.unwrap();
    let retry_at = chrono::Utc::now() + chrono::Duration::seconds(60);
    assert!(repo
        .mark_failed(inserted.id, token, "timeout", Some(retry_at))
        .await
        .unwrap());

    // Not claimable while the backoff delay runs.
    let other = courier_core::next_lock_token();
    assert!(repo.claim_batch(10, Duration::from_secs(60), other).await.unwrap().is_empty());

    repo.clear_visibility(inserted.id);
    let batch = repo.claim_batch(10, Duration::from_secs(60), other).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].retry_count, 1);
}

#[tokio::test]
async fn insert_round_trips_and_rejects_duplicate_tracking_ids() {
    let repo = InMemoryOutboxRepository::new();
    let tracking_id = Uuid::new_v4();
    let event = NewEvent::new("order", "order-9", "OrderCreated", json!({"nested": {"a": [1, 2]}}))
        .with_tracking_id(tracking_id)
        .with_metadata(json!({"trace_id": "abc"}));

    let inserted = repo.insert(event.clone()).await.unwrap();
    assert!(inserted.id > 0);

    let found = repo.find_by_tracking_id(tracking_id).await.unwrap().unwrap();
    assert_eq!(found.payload, json!({"nested": {"a": [1, 2]}}));
    assert_eq!(found.metadata, json!({"trace_id": "abc"}));
    assert_eq!(found.status, EventStatus::Pending);

    let err = repo.insert(event).await.unwrap_err();
    assert!(matches!(err, OutboxError::DuplicateTrackingId(id) if id == tracking_id));
}

#[tokio::test]
async fn find_recent_pages_stably_in_both_directions() {
    let repo = InMemoryOutboxRepository::new();
    for n in 0..10 {
        repo.insert(NewEvent::new("order", format!("order-{n}"), "OrderCreated", json!({})))
            .await
            .unwrap();
    }

    let page = repo.find_recent(RecentQuery::latest(3)).await.unwrap();
    assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![10, 9, 8]);
    assert!(page.has_more);

    let page = repo.find_recent(RecentQuery::before(5, 4)).await.unwrap();
    assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 2, 1]);
    assert!(!page.has_more);

    // Property: all ids > cursor, descending, has_more iff a further row
    // existed at query time.
    let page = repo.find_recent(RecentQuery::after(3, 4)).await.unwrap();
    assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![7, 6, 5]);
    assert!(page.has_more);

    let page = repo.find_recent(RecentQuery::after(3, 8)).await.unwrap();
    assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![10, 9]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn dead_letter_stats_aggregate_by_type() {
    let repo = InMemoryOutboxRepository::new();
    let token = courier_core::next_lock_token();
    for (event_type, error) in [
        ("OrderCreated", "boom"),
        ("OrderCreated", "boom"),
        ("OrderShipped", "no route"),
    ] {
        let inserted = repo
            .insert(NewEvent::new("order", "order-1", event_type, json!({})))
            .await
            .unwrap();
        repo.claim_batch(10, Duration::from_secs(60), token).await.unwrap();
        repo.mark_dead_letter(inserted.id, token, error).await.unwrap();
    }

    let stats = repo.dead_letter_stats().await.unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].event_type, "OrderCreated");
    assert_eq!(stats[0].count, 2);
    assert_eq!(stats[0].sample_errors, vec!["boom".to_string()]);
    assert_eq!(stats[1].event_type, "OrderShipped");
    assert_eq!(stats[1].count, 1);
}

// ============================================================================
// Backpressure and health
// ============================================================================

#[tokio::test]
async fn backlog_limiter_applies_configured_action() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    for n in 0..3 {
        repo.insert(NewEvent::new("order", format!("order-{n}"), "OrderCreated", json!({})))
            .await
            .unwrap();
    }

    let reject = BacklogLimiter::new(
        repo.clone(),
        BacklogPolicy { max_backlog_size: 3, action: OverflowAction::Reject },
    );
    let err = reject.admit().await.unwrap_err();
    assert!(matches!(err, OutboxError::BacklogExceeded { pending: 3, max: 3 }));

    let warn = BacklogLimiter::new(
        repo.clone(),
        BacklogPolicy { max_backlog_size: 3, action: OverflowAction::Warn },
    );
    assert_eq!(warn.admit().await.unwrap(), Admission::Admitted);

    let shed = BacklogLimiter::new(
        repo.clone(),
        BacklogPolicy { max_backlog_size: 3, action: OverflowAction::Drop },
    );
    assert_eq!(shed.admit().await.unwrap(), Admission::Shed);

    let roomy = BacklogLimiter::new(
        repo.clone(),
        BacklogPolicy { max_backlog_size: 100, action: OverflowAction::Reject },
    );
    assert_eq!(roomy.admit().await.unwrap(), Admission::Admitted);
    assert_eq!(roomy.utilization_pct().await.unwrap(), 3.0);
}

#[tokio::test]
async fn health_monitor_grades_worst_of() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let monitor = HealthMonitor::new(repo.clone(), HealthThresholds::default(), 100);

    let report = monitor.check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    let gauges = report.gauges.unwrap();
    assert_eq!(gauges.pending, 0);
    assert_eq!(gauges.oldest_pending_age_seconds, 0);

    // One dead-lettered event degrades at the default threshold.
    let inserted = repo.insert(order_event()).await.unwrap();
    let token = courier_core::next_lock_token();
    repo.claim_batch(1, Duration::from_secs(60), token).await.unwrap();
    repo.mark_dead_letter(inserted.id, token, "boom").await.unwrap();

    let report = monitor.check().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    let dead_letter = report.checks.iter().find(|c| c.name == "dead_letter").unwrap();
    assert_eq!(dead_letter.status, HealthStatus::Degraded);

    // Unreachable database trumps everything.
    repo.set_unavailable(true);
    let report = monitor.check().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report.gauges.is_none());
}

// ============================================================================
// Consumer idempotency
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn mark_processed_has_exactly_one_winner() {
    let store = Arc::new(InMemoryInboxStore::new());
    let tracking_id = Uuid::new_v4();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.mark_processed(tracking_id, "svc").await.unwrap()
        }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(store.is_processed(tracking_id).await.unwrap());
    assert!(!store.mark_processed(tracking_id, "svc").await.unwrap());

    let record = store.record(tracking_id).await.unwrap().unwrap();
    assert_eq!(record.consumer_id, "svc");
}

#[tokio::test]
async fn idempotent_executor_runs_once_and_keeps_the_mark() {
    let store = Arc::new(InMemoryInboxStore::new());
    let executor = IdempotentExecutor::new(store.clone(), "billing");
    let tracking_id = Uuid::new_v4();

    // First delivery executes, even when the operation itself fails: the
    // mark is not rolled back and the operation must be idempotent.
    let outcome = executor
        .execute(tracking_id, || async { Err::<(), _>("charge failed") })
        .await
        .unwrap();
    assert!(outcome.was_executed());

    let outcome = executor
        .execute(tracking_id, || async { Ok::<_, &str>(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Handled::Skipped);

    assert_eq!(store.len(), 1);
}
