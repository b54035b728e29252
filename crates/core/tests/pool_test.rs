//! Pool behavior against in-memory scripted workers

use std::sync::Arc;
use std::time::Duration;

use pyfleet_core::testing::{CollectingObserver, InMemorySpawner};
use pyfleet_core::{
    CheckinOutcome, CheckoutMode, ErrorCategory, ErrorKind, MigrationStatus, Pool, PoolConfig,
    RecoveryConfig, WorkerHealth, WorkerState,
};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

fn config(size: usize) -> PoolConfig {
    PoolConfig::default()
        .with_size(size)
        .with_checkout_timeout(Duration::from_millis(200))
        .with_operation_timeout(Duration::from_secs(2))
        .with_health_check_interval(Duration::ZERO)
        .with_shutdown_grace(Duration::from_millis(200))
}

struct Harness {
    pool: Pool,
    spawner: Arc<InMemorySpawner>,
    observer: Arc<CollectingObserver>,
}

async fn start(config: PoolConfig, recovery: RecoveryConfig) -> Harness {
    let spawner = Arc::new(InMemorySpawner::new());
    let observer = Arc::new(CollectingObserver::new());
    let pool = Pool::builder(spawner.clone())
        .with_config(config)
        .with_recovery(recovery)
        .with_observer(observer.clone())
        .start()
        .await
        .unwrap();
    Harness {
        pool,
        spawner,
        observer,
    }
}

async fn whoami(pool: &Pool, mode: CheckoutMode) -> String {
    let result = pool.execute(mode, "whoami", json!({})).await.unwrap();
    result["worker_id"].as_str().unwrap().to_string()
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_eager_start_creates_size_workers() {
    let h = start(config(3), RecoveryConfig::default()).await;

    let status = h.pool.status();
    assert_eq!(status.workers, 3);
    assert_eq!(status.available, 3);
    assert_eq!(status.by_state.get("ready"), Some(&3));
    assert_eq!(h.observer.count("worker.created"), 3);
    assert_eq!(
        h.spawner.worker_ids(),
        vec!["pyfleet-1", "pyfleet-2", "pyfleet-3"]
    );

    for info in h.pool.workers() {
        assert_eq!(info.state, WorkerState::Ready);
        assert_eq!(info.health, WorkerHealth::Healthy);
        assert!(info.pid.is_some());
    }
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_eager_start_fails_when_no_worker_starts() {
    let spawner = Arc::new(InMemorySpawner::new());
    spawner.fail_next_spawns(2);
    let error = Pool::builder(spawner.clone())
        .with_config(config(2))
        .start()
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::WorkerInitFailed);
    assert_eq!(error.category(), ErrorCategory::ResourceError);
}

#[tokio::test]
async fn test_partial_start_keeps_running_workers() {
    let spawner = Arc::new(InMemorySpawner::new());
    spawner.fail_next_spawns(1);
    let pool = Pool::builder(spawner.clone())
        .with_config(config(2))
        .with_recovery(RecoveryConfig::default().with_replace_removed_workers(true))
        .start()
        .await
        .unwrap();

    assert_eq!(pool.status().workers, 1);
    let mut requests = pool.take_replacement_requests().unwrap();
    assert!(requests.try_recv().is_ok());
    pool.shutdown().await;
}

#[tokio::test]
async fn test_lazy_pool_grows_on_demand() {
    let h = start(config(2).with_eager_start(false), RecoveryConfig::default()).await;
    assert_eq!(h.pool.status().workers, 0);

    let first = whoami(&h.pool, CheckoutMode::AnyWorker).await;
    assert_eq!(first, "pyfleet-1");
    assert_eq!(h.pool.status().workers, 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let error = Pool::builder(Arc::new(InMemorySpawner::new()))
        .with_config(PoolConfig::default().with_size(0))
        .start()
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::UnexpectedError);
    assert!(error.message.contains("size"));
}

// =============================================================================
// Session affinity
// =============================================================================

#[tokio::test]
async fn test_session_sticks_to_one_worker() {
    let h = start(config(3), RecoveryConfig::default()).await;

    let first = whoami(&h.pool, CheckoutMode::session("s1")).await;
    for _ in 0..5 {
        // Unrelated traffic in between must not move the session
        whoami(&h.pool, CheckoutMode::AnyWorker).await;
        assert_eq!(whoami(&h.pool, CheckoutMode::session("s1")).await, first);
    }
    assert_eq!(h.pool.session_worker("s1"), Some(first.clone()));
    assert!(h.pool.worker_info(&first).unwrap().sessions.contains(&"s1".to_string()));
    assert!(h.pool.migrations().is_empty());
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_anonymous_checkout_records_no_affinity() {
    let h = start(config(2), RecoveryConfig::default()).await;
    whoami(&h.pool, CheckoutMode::Anonymous).await;
    assert_eq!(h.pool.status().active_sessions, 0);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_session_moves_after_worker_removed() {
    let h = start(config(2), RecoveryConfig::default()).await;

    let first = whoami(&h.pool, CheckoutMode::session("s1")).await;
    assert!(h.pool.remove_worker(&first, "test").await);
    assert_eq!(h.pool.session_worker("s1"), None);

    let second = whoami(&h.pool, CheckoutMode::session("s1")).await;
    assert_ne!(first, second);
    assert_eq!(h.pool.session_worker("s1"), Some(second));
    assert!(h.spawner.commands(&first).contains(&"shutdown".to_string()));
    assert_eq!(h.observer.count("worker.terminated"), 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_busy_preferred_worker_migrates_session() {
    let h = start(config(2), RecoveryConfig::default()).await;

    let held = h.pool.checkout(CheckoutMode::session("s1")).await.unwrap();
    let original = held.worker_id().to_string();
    assert!(held.migration_id().is_none());

    let moved = h.pool.checkout(CheckoutMode::session("s1")).await.unwrap();
    assert_ne!(moved.worker_id(), original);
    let migration_id = moved.migration_id().unwrap();
    let target = moved.worker_id().to_string();
    moved.checkin(CheckinOutcome::Ok);

    let record = h
        .pool
        .migrations()
        .into_iter()
        .find(|m| m.id == migration_id)
        .unwrap();
    assert_eq!(record.status, MigrationStatus::Completed);
    assert_eq!(record.from_worker, original);
    assert_eq!(record.to_worker, target);
    assert_eq!(h.pool.session_worker("s1"), Some(target));

    let rolled_back = h.pool.rollback_migration(migration_id).unwrap();
    assert_eq!(rolled_back.status, MigrationStatus::RolledBack);
    assert_eq!(h.pool.session_worker("s1"), Some(original));
    assert!(h.pool.rollback_migration(migration_id).is_err());

    held.checkin(CheckinOutcome::Ok);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_rollback_to_removed_worker_fails() {
    let h = start(config(2), RecoveryConfig::default()).await;

    let held = h.pool.checkout(CheckoutMode::session("s1")).await.unwrap();
    let original = held.worker_id().to_string();
    let moved = h.pool.checkout(CheckoutMode::session("s1")).await.unwrap();
    let migration_id = moved.migration_id().unwrap();
    moved.checkin(CheckinOutcome::Ok);
    held.checkin(CheckinOutcome::Close);

    let error = h.pool.rollback_migration(migration_id).unwrap_err();
    assert_eq!(error.kind, ErrorKind::PoolUnavailable);
    assert_eq!(error.context.worker_id.as_deref(), Some(original.as_str()));
    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_racing_removal_leaves_no_stale_hint() {
    for _ in 0..10 {
        let h = start(config(2), RecoveryConfig::default()).await;

        let held = h.pool.checkout(CheckoutMode::session("s1")).await.unwrap();
        let original = held.worker_id().to_string();
        let moved = h.pool.checkout(CheckoutMode::session("s1")).await.unwrap();
        let migration_id = moved.migration_id().unwrap();
        moved.checkin(CheckinOutcome::Ok);
        held.checkin(CheckinOutcome::Ok);

        let rollback = {
            let pool = h.pool.clone();
            tokio::spawn(async move { pool.rollback_migration(migration_id).is_ok() })
        };
        let removal = {
            let pool = h.pool.clone();
            let original = original.clone();
            tokio::spawn(async move { pool.remove_worker(&original, "test").await })
        };
        let _rolled_back = rollback.await.unwrap();
        assert!(removal.await.unwrap());

        assert!(h.pool.worker_info(&original).is_none());
        assert_ne!(h.pool.session_worker("s1"), Some(original));
        h.pool.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_binding_expires_after_ttl() {
    let h = start(
        config(2)
            .with_session_ttl(Duration::from_secs(30))
            .with_affinity_sweep_interval(Duration::from_secs(10)),
        RecoveryConfig::default(),
    )
    .await;

    whoami(&h.pool, CheckoutMode::session("s1")).await;
    assert_eq!(h.pool.status().active_sessions, 1);

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(h.pool.session_worker("s1"), None);
    assert_eq!(h.pool.status().active_sessions, 0);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_end_session_forgets_binding() {
    let h = start(config(2), RecoveryConfig::default()).await;
    whoami(&h.pool, CheckoutMode::session("s1")).await;
    assert!(h.pool.end_session("s1"));
    assert!(!h.pool.end_session("s1"));
    assert_eq!(h.pool.session_worker("s1"), None);
    h.pool.shutdown().await;
}

// =============================================================================
// Checkout limits
// =============================================================================

#[tokio::test]
async fn test_checkout_times_out_when_all_busy() {
    let h = start(config(1), RecoveryConfig::default()).await;

    let held = assert_ok!(h.pool.checkout(CheckoutMode::AnyWorker).await);
    let error = assert_err!(h.pool.checkout(CheckoutMode::session("s2")).await);
    assert_eq!(error.kind, ErrorKind::CheckoutTimeout);
    assert_eq!(error.category(), ErrorCategory::TimeoutError);
    assert!(error.is_retryable());
    assert_eq!(error.context.session_id.as_deref(), Some("s2"));

    held.checkin(CheckinOutcome::Ok);
    assert_ok!(h.pool.checkout(CheckoutMode::AnyWorker).await);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_waiter_is_woken_by_checkin() {
    let h = start(
        config(1).with_checkout_timeout(Duration::from_secs(2)),
        RecoveryConfig::default(),
    )
    .await;

    let held = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let pool = h.pool.clone();
    let waiter = tokio::spawn(async move { pool.checkout(CheckoutMode::AnyWorker).await.map(|l| l.worker_id().to_string()) });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let worker_id = held.worker_id().to_string();
    held.checkin(CheckinOutcome::Ok);

    assert_eq!(waiter.await.unwrap().unwrap(), worker_id);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_overflow_worker_is_retired_on_checkin() {
    let h = start(config(1).with_max_overflow(1), RecoveryConfig::default()).await;

    let base = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let extra = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let extra_id = extra.worker_id().to_string();
    assert!(h.pool.worker_info(&extra_id).unwrap().overflow);
    assert_eq!(h.pool.status().overflow_workers, 1);

    // Overflow is capped
    let error = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::CheckoutTimeout);

    extra.checkin(CheckinOutcome::Ok);
    assert!(h.pool.worker_info(&extra_id).is_none());
    base.checkin(CheckinOutcome::Ok);

    let status = h.pool.status();
    assert_eq!(status.workers, 1);
    assert_eq!(status.overflow_workers, 0);
    h.pool.shutdown().await;
}

// =============================================================================
// Failures and recovery
// =============================================================================

#[tokio::test]
async fn test_command_error_keeps_worker() {
    let h = start(config(1), RecoveryConfig::default()).await;

    let error = h
        .pool
        .execute(CheckoutMode::AnyWorker, "fail", json!({"message": "bad input"}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::CommandFailed);
    assert_eq!(error.context.command.as_deref(), Some("fail"));
    assert_eq!(error.context.metadata.get("error_type"), Some(&Value::from("ValueError")));

    let workers = h.pool.workers();
    let info = &workers[0];
    assert_eq!(info.state, WorkerState::Ready);
    assert_eq!(info.consecutive_failures, 0);
    assert_eq!(info.stats.error_checkins, 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_crash_surfaces_as_communication_error() {
    let h = start(config(2), RecoveryConfig::default()).await;

    let error = h
        .pool
        .execute(CheckoutMode::Anonymous, "crash", json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::ChannelClosed);
    assert_eq!(error.category(), ErrorCategory::CommunicationError);
    let crashed = error.context.worker_id.clone().unwrap();

    assert!(h.pool.worker_info(&crashed).is_none());
    assert_eq!(h.pool.status().workers, 1);

    // The surviving worker is unaffected
    let survivor = whoami(&h.pool, CheckoutMode::AnyWorker).await;
    assert_ne!(survivor, crashed);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_dead_idle_worker_is_skipped_at_checkout() {
    let h = start(config(2), RecoveryConfig::default()).await;

    let victim = "pyfleet-1";
    assert!(h.spawner.crash(victim).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Anonymous checkout would pick pyfleet-1 first if it were usable
    assert_eq!(whoami(&h.pool, CheckoutMode::Anonymous).await, "pyfleet-2");
    assert!(h.pool.worker_info(victim).is_none());
    assert!(h.observer.count("worker.removed") >= 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_consecutive_timeouts_remove_worker() {
    let h = start(
        config(1)
            .with_operation_timeout(Duration::from_millis(50))
            .with_max_consecutive_failures(3),
        RecoveryConfig::default().with_timeout_retry_delay(Duration::ZERO),
    )
    .await;
    let worker_id = h.pool.workers()[0].id.clone();

    for attempt in 1..=2 {
        let error = h
            .pool
            .execute(CheckoutMode::AnyWorker, "sleep", json!({"ms": 150}))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::OperationTimeout);

        let info = h.pool.worker_info(&worker_id).unwrap();
        assert_eq!(info.state, WorkerState::Degraded);
        assert_eq!(info.consecutive_failures, attempt);

        // The probe queues behind the sleep and brings the worker back
        let report = h.pool.health_check_all().await;
        assert_eq!(report.recovered, 1);
    }

    let error = h
        .pool
        .execute(CheckoutMode::AnyWorker, "sleep", json!({"ms": 150}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::OperationTimeout);
    assert!(h.pool.worker_info(&worker_id).is_none());
    assert_eq!(h.observer.count("worker.removed"), 1);

    // No live worker and no way to start one on demand
    let error = h
        .pool
        .checkout(CheckoutMode::AnyWorker)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::PoolUnavailable);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_unhealthy_worker_is_degraded_then_recovers() {
    let h = start(
        config(2),
        RecoveryConfig::default()
            .with_degrade_delay(Duration::ZERO)
            .with_health_failure_threshold(3),
    )
    .await;

    h.spawner.set_healthy("pyfleet-1", false);
    let report = h.pool.health_check_all().await;
    assert_eq!(report.checked, 2);
    assert_eq!(report.healthy, 1);
    assert_eq!(report.unhealthy, 1);

    let info = h.pool.worker_info("pyfleet-1").unwrap();
    assert_eq!(info.state, WorkerState::Degraded);
    assert_eq!(info.health, WorkerHealth::Unhealthy);
    assert_eq!(h.pool.status().available, 1);

    h.spawner.set_healthy("pyfleet-1", true);
    let report = h.pool.health_check_all().await;
    assert_eq!(report.recovered, 1);
    assert_eq!(h.pool.worker_info("pyfleet-1").unwrap().state, WorkerState::Ready);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_repeated_health_failures_remove_worker() {
    let h = start(
        config(2),
        RecoveryConfig::default()
            .with_degrade_delay(Duration::ZERO)
            .with_health_failure_threshold(2)
            .with_replace_removed_workers(true),
    )
    .await;
    let mut requests = h.pool.take_replacement_requests().unwrap();

    h.spawner.set_healthy("pyfleet-2", false);
    h.pool.health_check_all().await;
    let report = h.pool.health_check_all().await;
    assert_eq!(report.removed, 1);
    assert!(h.pool.worker_info("pyfleet-2").is_none());

    let request = requests.recv().await.unwrap();
    assert_eq!(request.worker_id, "pyfleet-2");
    assert_eq!(h.observer.count("pool.replacement_requested"), 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_dropped_lease_returns_worker() {
    let h = start(config(1), RecoveryConfig::default()).await;
    {
        let _lease = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    }
    assert_eq!(h.pool.status().available, 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_call_closes_worker_on_drop() {
    let h = start(config(2), RecoveryConfig::default()).await;
    let lease = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let worker_id = lease.worker_id().to_string();

    let args = json!({"ms": 500});
    let call = lease.execute("sleep", &args);
    assert_err!(tokio::time::timeout(Duration::from_millis(20), call).await);
    drop(lease);

    assert!(h.pool.worker_info(&worker_id).is_none());
    assert_eq!(h.observer.count("worker.removed"), 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_health_check_takes_worker_out_of_rotation() {
    let spawner = Arc::new(InMemorySpawner::new().with_ping_delay(Duration::from_millis(400)));
    let observer = Arc::new(CollectingObserver::new());
    let pool = Pool::builder(spawner.clone())
        .with_config(config(1))
        .with_observer(observer.clone())
        .start()
        .await
        .unwrap();

    let checkout_during_check = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().available, 0);
        pool.checkout(CheckoutMode::AnyWorker).await
    };
    let (report, during) = tokio::join!(pool.health_check_all(), checkout_during_check);

    assert_eq!(during.unwrap_err().kind, ErrorKind::CheckoutTimeout);
    assert_eq!(report.checked, 1);
    assert_eq!(report.healthy, 1);

    // Back in rotation once the check is done; an unused lease returns it intact
    let lease = assert_ok!(pool.checkout(CheckoutMode::AnyWorker).await);
    drop(lease);
    assert_eq!(pool.status().available, 1);
    assert_eq!(observer.count("worker.removed"), 0);
    assert_eq!(spawner.commands("pyfleet-1"), vec!["ping"]);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_close_outcome_discards_worker() {
    let h = start(config(2), RecoveryConfig::default()).await;
    let lease = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let worker_id = lease.worker_id().to_string();
    h.pool.checkin(lease, CheckinOutcome::Close);

    assert!(h.pool.worker_info(&worker_id).is_none());
    assert_eq!(h.pool.status().workers, 1);
    h.pool.shutdown().await;
}

// =============================================================================
// Protocol anomalies
// =============================================================================

#[tokio::test]
async fn test_stray_responses_are_counted() {
    let h = start(config(1), RecoveryConfig::default()).await;

    let result = h
        .pool
        .execute(CheckoutMode::AnyWorker, "stray", json!({}))
        .await
        .unwrap();
    assert_eq!(result["stray"], true);

    assert_eq!(h.pool.status().correlation_anomalies, 1);
    assert_eq!(h.observer.count("protocol.correlation_anomaly"), 1);
    // The worker stays in service
    assert_eq!(h.pool.workers()[0].state, WorkerState::Ready);
    h.pool.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_terminates_workers_and_rejects_checkouts() {
    let h = start(config(2), RecoveryConfig::default()).await;
    whoami(&h.pool, CheckoutMode::session("s1")).await;

    h.pool.shutdown().await;
    assert!(h.pool.is_shutting_down());

    let status = h.pool.status();
    assert_eq!(status.workers, 0);
    assert_eq!(status.active_sessions, 0);
    assert_eq!(h.observer.count("worker.terminated"), 2);

    for worker_id in h.spawner.worker_ids() {
        assert!(h.spawner.commands(&worker_id).contains(&"shutdown".to_string()));
        assert!(!h.spawner.was_killed(&worker_id));
    }

    let error = h.pool.checkout(CheckoutMode::AnyWorker).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::PoolUnavailable);

    // Idempotent
    h.pool.shutdown().await;
}
