//! Replacement supervisor
//!
//! The pool only signals that a removed worker should be replaced; this
//! task consumes those signals and provisions fresh workers with retry, so
//! spawning never happens inside the pool's own bookkeeping.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{ErrorKind, PoolError};
use crate::pool::{Pool, ReplacementRequest};
use crate::retry::{RetryExecutor, RetryPolicy};

pub struct ReplacementSupervisor {
    pool: Pool,
    policy: RetryPolicy,
    executor: RetryExecutor,
}

impl ReplacementSupervisor {
    pub fn new(pool: Pool) -> Self {
        let executor = RetryExecutor::new().with_observer(pool.observer());
        Self {
            pool,
            policy: RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_millis(500)),
            executor,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start consuming replacement signals
    ///
    /// Returns `None` if another consumer already took the pool's receiver.
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        let requests = self.pool.take_replacement_requests()?;
        Some(tokio::spawn(self.run(requests)))
    }

    async fn run(self, mut requests: mpsc::UnboundedReceiver<ReplacementRequest>) {
        let mut shutdown = self.pool.subscribe_shutdown();
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.replace(request).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("replacement supervisor stopped");
    }

    async fn replace(&self, request: ReplacementRequest) {
        let result = self
            .executor
            .with_retry(&self.policy, |_attempt| {
                let pool = self.pool.clone();
                async move {
                    pool.provision_worker().await.map_err(|e| {
                        // A worker that failed to start may start on the next try
                        if e.kind == ErrorKind::WorkerInitFailed {
                            e.with_retryable(true)
                        } else {
                            e
                        }
                    })
                }
            })
            .await;

        match result {
            Ok(Some(worker_id)) => {
                info!(replaced = %request.worker_id, worker_id = %worker_id, "worker replaced")
            }
            Ok(None) => debug!(replaced = %request.worker_id, "pool already at size"),
            Err(e) if self.pool.is_shutting_down() => {
                debug!(error = %e, "replacement abandoned during shutdown")
            }
            Err(e) => {
                let failure = PoolError::new(
                    ErrorKind::SupervisorFailure,
                    format!("could not replace worker {}: {}", request.worker_id, e.message),
                )
                .with_worker(&request.worker_id);
                error!(error = %failure, reason = %request.reason, "worker replacement failed");
            }
        }
    }
}
