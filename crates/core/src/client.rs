//! Call-site client
//!
//! [`FleetClient`] wraps [`Pool::execute`] in a [`RetryExecutor`], optionally
//! routing every attempt through a named circuit breaker shared with the
//! pool.

use serde_json::Value;
use tracing::instrument;

use crate::error::PoolError;
use crate::pool::{CheckoutMode, Pool};
use crate::retry::{RetryExecutor, RetryPolicy};

#[derive(Clone)]
pub struct FleetClient {
    pool: Pool,
    executor: RetryExecutor,
    policy: RetryPolicy,
}

impl FleetClient {
    /// Client with the default retry policy and no circuit
    pub fn new(pool: Pool) -> Self {
        let executor = RetryExecutor::new()
            .with_circuits(pool.circuits())
            .with_observer(pool.observer());
        Self {
            pool,
            executor,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `command` on a worker chosen by `mode`, retrying per the policy
    #[instrument(skip(self, args), fields(circuit = ?self.policy.circuit))]
    pub async fn execute(&self, mode: CheckoutMode, command: &str, args: Value) -> Result<Value, PoolError> {
        self.executor
            .with_retry(&self.policy, |_attempt| {
                let pool = self.pool.clone();
                let mode = mode.clone();
                let args = args.clone();
                async move { pool.execute(mode, command, args).await }
            })
            .await
    }

    pub async fn execute_in_session(
        &self,
        session_id: &str,
        command: &str,
        args: Value,
    ) -> Result<Value, PoolError> {
        self.execute(CheckoutMode::session(session_id), command, args)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::ErrorKind;
    use crate::pool::PoolConfig;
    use crate::testing::InMemorySpawner;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn pool(size: usize) -> Pool {
        Pool::builder(Arc::new(InMemorySpawner::new()))
            .with_config(
                PoolConfig::default()
                    .with_size(size)
                    .with_health_check_interval(Duration::ZERO),
            )
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_success() {
        let client = FleetClient::new(pool(1).await);
        let result = client
            .execute(CheckoutMode::AnyWorker, "echo", json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!({"a": 1}));
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_command_failure_is_not_retried() {
        let client = FleetClient::new(pool(1).await)
            .with_retry_policy(RetryPolicy::exponential().with_base_delay(Duration::from_millis(1)));
        let error = client
            .execute(CheckoutMode::AnyWorker, "fail", json!({"message": "bad input"}))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::CommandFailed);
        assert_eq!(error.context.attempt, Some(1));
        assert_eq!(error.message, "bad input");
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_session_calls_route_through_circuit() {
        let client = FleetClient::new(pool(2).await).with_retry_policy(
            RetryPolicy::no_retry().with_circuit("python"),
        );
        client
            .execute_in_session("s1", "ping", json!({}))
            .await
            .unwrap();

        let breaker = client.pool().circuits().get("python").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        client.pool().shutdown().await;
    }
}
