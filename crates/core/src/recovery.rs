//! Worker recovery policy
//!
//! Decides what happens to a worker after a failure. Rules are evaluated in
//! order and the first match wins:
//!
//! 1. channel/process exited, or connection failure at checkout → remove
//! 2. health check failed → remove at the threshold, otherwise degrade
//! 3. operation timeout → retry when the error is retryable, otherwise remove
//! 4. max consecutive failures exceeded → remove
//! 5. not ready at checkout → remove
//! 6. anything else → retry when retryable, otherwise remove
//!
//! When `replace_removed_workers` is set and the pool is not shutting down,
//! `remove` becomes `replace`. The pool applies the resulting strategy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duration_millis;
use crate::error::{ErrorKind, PoolError};
use crate::state_machine::WorkerState;

/// What went wrong with a worker
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    ChannelExited { reason: String },
    CheckoutConnectionFailed { reason: String },
    HealthCheckFailed(PoolError),
    OperationTimeout(PoolError),
    MaxFailuresExceeded { failures: u32 },
    NotReadyAtCheckout,
    Error(PoolError),
}

impl FailureReason {
    /// Classify an error observed during an operation
    pub fn from_error(error: PoolError) -> Self {
        match error.kind {
            ErrorKind::ChannelClosed => Self::ChannelExited {
                reason: error.message,
            },
            ErrorKind::OperationTimeout => Self::OperationTimeout(error),
            _ => Self::Error(error),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::ChannelExited { reason } => format!("channel exited: {reason}"),
            Self::CheckoutConnectionFailed { reason } => {
                format!("connection failed at checkout: {reason}")
            }
            Self::HealthCheckFailed(error) => format!("health check failed: {error}"),
            Self::OperationTimeout(error) => format!("operation timed out: {error}"),
            Self::MaxFailuresExceeded { failures } => {
                format!("{failures} consecutive failures")
            }
            Self::NotReadyAtCheckout => "worker not ready at checkout".to_string(),
            Self::Error(error) => error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Keep the worker, cooling it down before it takes work again
    Retry,
    /// Keep the worker but mark it unhealthy until a health check passes
    Degrade,
    /// Terminate the worker
    Remove,
    /// Terminate the worker and ask for a fresh one
    Replace,
}

impl RecoveryAction {
    pub fn removes_worker(&self) -> bool {
        matches!(self, Self::Remove | Self::Replace)
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Degrade => write!(f, "degrade"),
            Self::Remove => write!(f, "remove"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,

    #[serde(with = "duration_millis")]
    pub delay: Duration,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl RecoveryStrategy {
    fn new(action: RecoveryAction, delay: Duration, rule: &'static str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("rule".to_string(), Value::from(rule));
        Self {
            action,
            delay,
            metadata,
        }
    }

    fn remove(rule: &'static str) -> Self {
        Self::new(RecoveryAction::Remove, Duration::ZERO, rule)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failed health checks before a worker is removed
    pub health_failure_threshold: u32,

    /// Cool-down for degraded workers
    #[serde(with = "duration_millis")]
    pub degrade_delay: Duration,

    /// Cool-down after a retryable operation timeout
    #[serde(with = "duration_millis")]
    pub timeout_retry_delay: Duration,

    /// Upgrade `remove` to `replace`
    pub replace_removed_workers: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            health_failure_threshold: 3,
            degrade_delay: Duration::from_secs(5),
            timeout_retry_delay: Duration::from_secs(3),
            replace_removed_workers: false,
        }
    }
}

impl RecoveryConfig {
    pub fn with_health_failure_threshold(mut self, threshold: u32) -> Self {
        self.health_failure_threshold = threshold.max(1);
        self
    }

    pub fn with_degrade_delay(mut self, delay: Duration) -> Self {
        self.degrade_delay = delay;
        self
    }

    pub fn with_timeout_retry_delay(mut self, delay: Duration) -> Self {
        self.timeout_retry_delay = delay;
        self
    }

    pub fn with_replace_removed_workers(mut self, replace: bool) -> Self {
        self.replace_removed_workers = replace;
        self
    }
}

/// Facts about the worker and pool at decision time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryContext {
    /// Including the failure being decided on
    pub consecutive_health_failures: u32,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn determine_strategy(
        &self,
        reason: &FailureReason,
        state: WorkerState,
        context: &RecoveryContext,
    ) -> RecoveryStrategy {
        let mut strategy = if matches!(state, WorkerState::Terminating | WorkerState::Terminated) {
            RecoveryStrategy::remove("already_terminating")
        } else {
            self.decide(reason, context)
        };

        if strategy.action == RecoveryAction::Remove
            && self.config.replace_removed_workers
            && !context.shutting_down
        {
            strategy.action = RecoveryAction::Replace;
        }
        strategy
    }

    fn decide(&self, reason: &FailureReason, context: &RecoveryContext) -> RecoveryStrategy {
        match reason {
            FailureReason::ChannelExited { .. } | FailureReason::CheckoutConnectionFailed { .. } => {
                RecoveryStrategy::remove("channel_exited")
            }
            FailureReason::HealthCheckFailed(_) => {
                if context.consecutive_health_failures >= self.config.health_failure_threshold {
                    RecoveryStrategy::remove("health_threshold")
                } else {
                    RecoveryStrategy::new(
                        RecoveryAction::Degrade,
                        self.config.degrade_delay,
                        "health_check_failed",
                    )
                }
            }
            FailureReason::OperationTimeout(error) => {
                if error.is_retryable() {
                    RecoveryStrategy::new(
                        RecoveryAction::Retry,
                        self.config.timeout_retry_delay,
                        "operation_timeout",
                    )
                } else {
                    RecoveryStrategy::remove("operation_timeout")
                }
            }
            FailureReason::MaxFailuresExceeded { .. } => {
                RecoveryStrategy::remove("max_failures_exceeded")
            }
            FailureReason::NotReadyAtCheckout => RecoveryStrategy::remove("not_ready_at_checkout"),
            FailureReason::Error(error) => {
                if error.is_retryable() {
                    RecoveryStrategy::new(
                        RecoveryAction::Retry,
                        self.config.timeout_retry_delay,
                        "retryable_error",
                    )
                } else {
                    RecoveryStrategy::remove("terminal_error")
                }
            }
        }
    }
}
