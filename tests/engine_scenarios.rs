//! End-to-end engine behaviour against the in-memory runtime.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lab_sandbox::events::{Event, EventSink, EventType};
use lab_sandbox::{Engine, EngineError};
use lab_sandbox::model::{
    Actor, EntryStatus, Operation, Quota, QuotaScope, Requester, Status, TransitionOutcome,
};
use lab_sandbox::quota::current_period;

use common::{ADDRESS, FakeRuntime, engine, find, request, test_config, wait_for};

fn cores_quota(user: u64, cores: u32) -> Quota {
    Quota {
        scope: QuotaScope::User,
        id: user,
        cores_limit: Some(cores),
        memory_mb_limit: None,
        disk_mb_limit: None,
        max_concurrent_containers: None,
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn address_on_third_poll_ends_running() {
    let runtime = Arc::new(FakeRuntime::ready_on(3));
    let (engine, _events) = engine(&test_config(), Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());

    let result = engine
        .provision(request("lab-ready", Requester::user(1), 1), &CancellationToken::new())
        .await
        .expect("provisioned");

    assert_eq!(result.address, ADDRESS);
    assert_eq!(result.ssh_port, 22);
    assert_eq!(result.credential.user, "labuser");
    assert_eq!(result.credential.public_key, common::KEY);
    assert!(result.credential.private_key.is_none());
    assert_eq!(result.host_key_fingerprint.as_deref(), Some("SHA256:fakefingerprint"));
    assert_eq!(runtime.polls("lab-ready"), 3);

    let container = engine.container(result.container).await.expect("active");
    assert_eq!(container.status, Status::Running);
    assert_eq!(container.address, Some(ADDRESS));
    assert!(container.started_at.is_some());

    let target = engine.shell_target(result.container).await.expect("running");
    assert_eq!(target.host, ADDRESS);
    assert_eq!(target.user, "labuser");

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn no_address_within_timeout_fails_container() {
    let runtime = Arc::new(FakeRuntime::never_ready());
    let (engine, _events) = engine(&test_config(), Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());

    let started = Instant::now();
    let err = engine
        .provision(request("lab-slow", Requester::user(1), 1), &CancellationToken::new())
        .await
        .expect_err("never reachable");

    assert!(matches!(err, EngineError::ProvisioningTimeout { .. }), "got {err}");
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(runtime.deletes(), ["lab-slow"], "partial instance torn down");

    let container = find(&engine, "lab-slow").await.expect("still active");
    assert_eq!(container.status, Status::Failed);
    let entries = engine.queue().entries_for(container.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Failed);
    assert_eq!(entries[0].attempts, 1, "timeouts are not retried");

    // failed -> running is not in the table; the refusal is still audited.
    let err = engine
        .start(container.id, &Actor::User(1))
        .await
        .expect_err("cannot start a failed container");
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    let last = engine
        .lifecycle()
        .audit_log(container.id)
        .await
        .pop()
        .expect("audit rows");
    assert_eq!(last.outcome, TransitionOutcome::Rejected);
    assert_eq!(last.old_status, Some(Status::Failed));
    assert_eq!(last.new_status, Status::Running);

    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_quota() {
    let mut config = test_config();
    config.quotas.push(cores_quota(1, 2));
    let (engine, _events) = engine(&config, Arc::new(FakeRuntime::ready_on(1)));
    let engine = Arc::new(engine);

    let mut tasks = Vec::new();
    for i in 0..3 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine
                .admit(&request(&format!("lab-{i}"), Requester::user(1), 1))
                .await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(_) => admitted += 1,
            Err(EngineError::QuotaExceeded { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!((admitted, rejected), (2, 1));
    let usage = engine
        .ledger()
        .usage(&Requester::user(1), current_period())
        .await
        .expect("counter");
    assert_eq!(usage.cores_used, 2);
    assert_eq!(usage.concurrent_containers, 2);
}

#[tokio::test]
async fn duplicate_name_is_rejected_without_charging_quota() {
    let (engine, _events) = engine(&test_config(), Arc::new(FakeRuntime::ready_on(1)));

    engine
        .admit(&request("lab-dup", Requester::user(1), 1))
        .await
        .expect("first admitted");
    let err = engine
        .admit(&request("lab-dup", Requester::user(2), 1))
        .await
        .expect_err("name taken");

    assert!(matches!(err, EngineError::NameInUse(_)));
    assert!(
        engine
            .ledger()
            .usage(&Requester::user(2), current_period())
            .await
            .is_none_or(|u| u.cores_used == 0)
    );
}

#[tokio::test]
async fn malformed_key_is_rejected_before_admission() {
    let (engine, _events) = engine(&test_config(), Arc::new(FakeRuntime::ready_on(1)));
    let mut req = request("lab-key", Requester::user(1), 1);
    req.public_key = Some("not a key".into());

    let err = engine.admit(&req).await.expect_err("bad key");
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert!(find(&engine, "lab-key").await.is_none());
}

/// Takes three seconds to accept every admission-granted event.
struct SlowGrantSink;

#[async_trait]
impl EventSink for SlowGrantSink {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        if event.event_type == EventType::AdmissionGranted {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn slow_event_sink_does_not_hold_the_reservation_lock() {
    let mut config = test_config();
    config.admission.lock_timeout_secs = 1;
    let engine = Engine::new(
        &config,
        Arc::new(FakeRuntime::never_ready()),
        Arc::new(SlowGrantSink),
    );

    let first = request("lab-slow-a", Requester::user(1), 1);
    let second = request("lab-slow-b", Requester::user(1), 1);
    let (a, b) = tokio::join!(engine.admit(&first), engine.admit(&second));

    assert!(a.is_ok(), "first admission: {a:?}");
    assert!(b.is_ok(), "second admission: {b:?}");
}

// ---------------------------------------------------------------------------
// Queue retry and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_failure_retries_to_ceiling_then_fails_once() {
    let runtime = Arc::new(FakeRuntime::ready_on(1).failing_launch());
    let (engine, events) = engine(&test_config(), Arc::clone(&runtime));
    let mut rx = events.subscribe();
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());

    let err = engine
        .provision(request("lab-broken", Requester::user(1), 1), &CancellationToken::new())
        .await
        .expect_err("launch always fails");

    assert!(
        matches!(err, EngineError::OperationRetryExhausted { attempts: 3, operation: Operation::Create, .. }),
        "got {err}"
    );
    assert_eq!(runtime.launches().len(), 3);
    assert_eq!(runtime.deletes().len(), 3, "each failed launch is torn down");

    let container = find(&engine, "lab-broken").await.expect("active");
    assert_eq!(container.status, Status::Failed);

    let failed_transitions = engine
        .lifecycle()
        .audit_log(container.id)
        .await
        .into_iter()
        .filter(|a| a.new_status == Status::Failed && a.outcome == TransitionOutcome::Applied)
        .count();
    assert_eq!(failed_transitions, 1);

    let mut failure_events = 0;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == lab_sandbox::events::EventType::OperationFailed {
            failure_events += 1;
        }
    }
    assert_eq!(failure_events, 1);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_readiness_tears_down() {
    let runtime = Arc::new(FakeRuntime::never_ready());
    let (engine, _events) = engine(&test_config(), Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(
        engine.provision(request("lab-cancel", Requester::user(1), 1), &cancel),
        async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        }
    );

    let err = result.expect_err("cancelled");
    assert!(matches!(err, EngineError::Cancelled { .. }), "got {err}");
    assert_eq!(runtime.deletes(), ["lab-cancel"]);
    let container = find(&engine, "lab-cancel").await.expect("active");
    assert_eq!(container.status, Status::Failed);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn delete_during_provisioning_cancels_and_archives() {
    let runtime = Arc::new(FakeRuntime::never_ready());
    let mut config = test_config();
    config.quotas.push(cores_quota(1, 1));
    let (engine, _events) = engine(&config, Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(
        engine.provision(request("lab-gone", Requester::user(1), 1), &cancel),
        async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let container = find(&engine, "lab-gone").await.expect("admitted");
            engine
                .delete(container.id, &Actor::User(1))
                .await
                .expect("delete queued");
        }
    );

    assert!(matches!(result, Err(EngineError::Cancelled { .. })));

    let archived = loop {
        if let Some(c) = engine.lifecycle().history().await.into_iter().find(|c| c.name == "lab-gone") {
            break c;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(archived.status, Status::Deleting);
    assert!(find(&engine, "lab-gone").await.is_none());
    assert!(runtime.deletes().iter().all(|n| n == "lab-gone"));
    assert!(!runtime.deletes().is_empty());

    let usage = engine
        .ledger()
        .usage(&Requester::user(1), current_period())
        .await
        .expect("counter");
    assert_eq!(usage.cores_used, 0, "quota released");

    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Operations on running containers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn delete_releases_quota_for_reuse() {
    let mut config = test_config();
    config.quotas.push(cores_quota(1, 2));
    let runtime = Arc::new(FakeRuntime::ready_on(1));
    let (engine, _events) = engine(&config, Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());
    let who = Requester::user(1);

    let first = engine
        .provision(request("lab-a", who, 2), &CancellationToken::new())
        .await
        .expect("fits");
    let err = engine
        .admit(&request("lab-b", who, 1))
        .await
        .expect_err("quota full");
    assert!(matches!(err, EngineError::QuotaExceeded { .. }));

    engine
        .delete(first.container, &Actor::User(1))
        .await
        .expect("delete queued");
    wait_for(&engine, first.container, 200, |c| c.is_none()).await;

    assert_eq!(runtime.deletes(), ["lab-a"]);
    engine
        .provision(request("lab-a", who, 2), &CancellationToken::new())
        .await
        .expect("name and quota are free again");

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn stop_start_and_snapshot_run_through_the_queue() {
    let runtime = Arc::new(FakeRuntime::ready_on(1));
    let (engine, _events) = engine(&test_config(), Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());
    let actor = Actor::User(1);

    let id = engine
        .provision(request("lab-ops", Requester::user(1), 1), &CancellationToken::new())
        .await
        .expect("provisioned")
        .container;

    assert!(engine.stop(id, &actor).await.expect("queued").is_some());
    let stopped = wait_for(&engine, id, 200, |c| c.is_some_and(|c| c.status == Status::Stopped))
        .await
        .expect("active");
    assert!(stopped.stopped_at.is_some());
    assert!(engine.shell_target(id).await.is_err());
    assert!(engine.stop(id, &actor).await.expect("no-op").is_none());

    engine.snapshot(id, "before-upgrade", &actor).await.expect("queued");
    wait_for(&engine, id, 200, |c| {
        c.is_some_and(|c| c.metadata.contains_key("last_snapshot"))
    })
    .await;
    assert_eq!(
        runtime.snapshots(),
        [("lab-ops".to_string(), "before-upgrade".to_string())]
    );

    assert!(engine.start(id, &actor).await.expect("queued").is_some());
    wait_for(&engine, id, 200, |c| c.is_some_and(|c| c.status == Status::Running)).await;
    assert_eq!(runtime.stops(), ["lab-ops"]);
    assert_eq!(runtime.starts(), ["lab-ops"]);

    let audit = engine.lifecycle().audit_log(id).await;
    assert!(
        audit
            .iter()
            .any(|a| a.new_status == Status::Stopped && a.changed_by == actor),
        "stop is attributed to the requesting user"
    );

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_stop_keeps_status_and_records_error() {
    let runtime = Arc::new(FakeRuntime::ready_on(1).failing_stop());
    let (engine, _events) = engine(&test_config(), Arc::clone(&runtime));
    let shutdown = CancellationToken::new();
    let _workers = engine.spawn_workers(shutdown.clone());

    let id = engine
        .provision(request("lab-stuck", Requester::user(1), 1), &CancellationToken::new())
        .await
        .expect("provisioned")
        .container;

    let entry = engine
        .stop(id, &Actor::User(1))
        .await
        .expect("queued")
        .expect("not a no-op");
    let container = wait_for(&engine, id, 200, |c| {
        c.is_some_and(|c| c.metadata.contains_key("last_operation_error"))
    })
    .await
    .expect("active");

    assert_eq!(container.status, Status::Running);
    assert_eq!(runtime.stops().len(), 3);
    let entry = engine.queue().get(entry).expect("known entry");
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.attempts, 3);

    shutdown.cancel();
}

#[tokio::test]
async fn stalled_creating_rows_are_failed() {
    let (engine, _events) = engine(&test_config(), Arc::new(FakeRuntime::ready_on(1)));
    let container = engine
        .admit(&request("lab-stall", Requester::user(1), 1))
        .await
        .expect("admitted");
    tokio::time::sleep(Duration::from_millis(5)).await;

    let failed = engine.fail_stalled(Duration::ZERO).await;

    assert_eq!(failed, [container.id]);
    assert_eq!(
        engine.container(container.id).await.expect("active").status,
        Status::Failed
    );
    assert!(engine.fail_stalled(Duration::ZERO).await.is_empty());
}
