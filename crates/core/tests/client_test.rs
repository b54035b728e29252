//! Retry and circuit breaking around pool calls

use std::sync::Arc;
use std::time::Duration;

use pyfleet_core::testing::{CollectingObserver, InMemorySpawner};
use pyfleet_core::{
    CheckinOutcome, CheckoutMode, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    ErrorKind, FleetClient, Pool, PoolConfig, RetryPolicy,
};
use serde_json::json;

async fn pool_with(
    spawner: Arc<InMemorySpawner>,
    observer: Arc<CollectingObserver>,
    circuits: Option<Arc<CircuitBreakerRegistry>>,
) -> Pool {
    let mut builder = Pool::builder(spawner)
        .with_config(
            PoolConfig::default()
                .with_size(1)
                .with_checkout_timeout(Duration::from_millis(50))
                .with_health_check_interval(Duration::ZERO)
                .with_shutdown_grace(Duration::from_millis(100)),
        )
        .with_observer(observer);
    if let Some(circuits) = circuits {
        builder = builder.with_circuits(circuits);
    }
    builder.start().await.unwrap()
}

#[test_log::test(tokio::test)]
async fn test_checkout_timeout_is_retried() {
    let observer = Arc::new(CollectingObserver::new());
    let pool = pool_with(Arc::new(InMemorySpawner::new()), observer.clone(), None).await;
    let client = FleetClient::new(pool.clone()).with_retry_policy(
        RetryPolicy::exponential()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(50))
            .with_jitter(false),
    );

    let held = pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        held.checkin(CheckinOutcome::Ok);
    });

    let result = client
        .execute(CheckoutMode::AnyWorker, "echo", json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(result, json!({"n": 1}));
    assert_eq!(observer.count("retry.succeeded"), 1);

    release.await.unwrap();
    pool.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_retries_exhausted_returns_last_error() {
    let observer = Arc::new(CollectingObserver::new());
    let pool = pool_with(Arc::new(InMemorySpawner::new()), observer.clone(), None).await;
    let client = FleetClient::new(pool.clone()).with_retry_policy(
        RetryPolicy::exponential()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false),
    );

    let held = pool.checkout(CheckoutMode::AnyWorker).await.unwrap();
    let error = client
        .execute_in_session("s1", "echo", json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::CheckoutTimeout);
    assert_eq!(error.context.attempt, Some(2));
    assert_eq!(error.context.session_id.as_deref(), Some("s1"));
    assert_eq!(observer.count("retry.exhausted"), 1);

    held.checkin(CheckinOutcome::Ok);
    pool.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_open_circuit_rejects_without_reaching_worker() {
    let spawner = Arc::new(InMemorySpawner::new());
    let observer = Arc::new(CollectingObserver::new());
    let circuits = Arc::new(CircuitBreakerRegistry::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_timeout(Duration::from_secs(60)),
    ));
    let pool = pool_with(spawner.clone(), observer.clone(), Some(circuits.clone())).await;
    let client = FleetClient::new(pool.clone())
        .with_retry_policy(RetryPolicy::no_retry().with_circuit("python"));

    for _ in 0..2 {
        let error = client
            .execute(CheckoutMode::AnyWorker, "fail", json!({"message": "boom"}))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::CommandFailed);
    }
    assert_eq!(circuits.get("python").unwrap().state(), CircuitState::Open);

    let worker_id = pool.workers()[0].id.clone();
    let sent_before = spawner.commands(&worker_id).len();

    let error = client
        .execute(CheckoutMode::AnyWorker, "echo", json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::CircuitOpen);
    assert!(error.is_circuit_rejection());
    assert_eq!(spawner.commands(&worker_id).len(), sent_before);

    // The circuit shows up in pool status
    let status = pool.status();
    assert_eq!(status.circuits.len(), 1);
    assert_eq!(status.circuits[0].name, "python");

    assert!(circuits.reset("python"));
    assert!(client
        .execute(CheckoutMode::AnyWorker, "echo", json!({}))
        .await
        .is_ok());
    pool.shutdown().await;
}
