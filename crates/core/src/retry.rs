//! Retry policy and executor
//!
//! Backoff strategies (attempt is 1-based):
//!
//! | Strategy | Delay |
//! |----------|-------|
//! | linear | `attempt * base` |
//! | exponential | `base * 2^(attempt-1)` |
//! | fibonacci | `fib(attempt) * base` |
//! | decorrelated jitter | `base + random() * (min(max, 3 * prior) - base)` |
//! | custom | caller-supplied function of `attempt` |
//!
//! Every strategy except decorrelated jitter may be perturbed by ±25%
//! jitter. All delays are capped at `max_delay` and never negative.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::duration_millis;
use crate::error::PoolError;
use crate::events::{emit, EventObserver, NoopEventObserver, PoolEvent};

/// Jitter applied to non-decorrelated strategies
const JITTER_FRACTION: f64 = 0.25;

/// Caller-supplied backoff function
#[derive(Clone)]
pub struct CustomBackoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl CustomBackoff {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for CustomBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomBackoff(..)")
    }
}

impl PartialEq for CustomBackoff {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Fibonacci,
    DecorrelatedJitter,
    #[serde(skip)]
    Custom(CustomBackoff),
}

impl BackoffStrategy {
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(CustomBackoff::new(f))
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            "fibonacci" => Ok(Self::Fibonacci),
            "decorrelated_jitter" | "decorrelated" => Ok(Self::DecorrelatedJitter),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Retry configuration for one call site
///
/// # Example
///
/// ```
/// use pyfleet_core::{BackoffStrategy, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_millis(200))
///     .with_circuit("python");
/// assert_eq!(policy.backoff, BackoffStrategy::Exponential);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    pub backoff: BackoffStrategy,

    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Apply ±25% jitter
    pub jitter: bool,

    /// Circuit breaker to route attempts through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 3 attempts, 1s base, 30s cap, jitter on
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            circuit: None,
        }
    }

    /// A single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::exponential()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_circuit(mut self, name: impl Into<String>) -> Self {
        self.circuit = Some(name.into());
        self
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Fresh per-call delay calculator
    pub fn backoff_calculator(&self) -> BackoffCalculator {
        BackoffCalculator::new(self)
    }
}

/// Delay state for one retried call
///
/// Holds the Fibonacci memo and the previous delay used by decorrelated
/// jitter, so nothing is shared between calls.
#[derive(Debug)]
pub struct BackoffCalculator {
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
    jitter: bool,
    fib: Vec<u64>,
    prior: Duration,
}

impl BackoffCalculator {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            strategy: policy.backoff.clone(),
            base: policy.base_delay,
            max: policy.max_delay,
            jitter: policy.jitter,
            fib: vec![0, 1],
            prior: policy.base_delay,
        }
    }

    /// Delay to wait after `attempt` fails
    pub fn delay_for_attempt(&mut self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base.as_secs_f64();
        let max = self.max.as_secs_f64();

        let raw = match &self.strategy {
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => base * 2f64.powi((attempt - 1).min(1023) as i32),
            BackoffStrategy::Fibonacci => base * self.fibonacci(attempt) as f64,
            BackoffStrategy::DecorrelatedJitter => {
                let upper = (3.0 * self.prior.as_secs_f64()).min(max);
                let span = (upper - base).max(0.0);
                let delay = clamp_secs(base + rand::thread_rng().gen::<f64>() * span, max);
                self.prior = delay;
                return delay;
            }
            BackoffStrategy::Custom(f) => (f.0)(attempt).as_secs_f64(),
        };

        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
            raw * (1.0 + factor)
        } else {
            raw
        };
        clamp_secs(jittered, max)
    }

    fn fibonacci(&mut self, n: u32) -> u64 {
        let n = n as usize;
        while self.fib.len() <= n {
            let len = self.fib.len();
            let next = self.fib[len - 1].saturating_add(self.fib[len - 2]);
            self.fib.push(next);
        }
        self.fib[n]
    }
}

fn clamp_secs(secs: f64, max: f64) -> Duration {
    if !secs.is_finite() {
        return Duration::from_secs_f64(max);
    }
    Duration::from_secs_f64(secs.clamp(0.0, max))
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    circuits: Option<Arc<CircuitBreakerRegistry>>,
    observer: Arc<dyn EventObserver>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            circuits: None,
            observer: Arc::new(NoopEventObserver),
        }
    }

    /// Circuit registry used when a policy names a circuit
    pub fn with_circuits(mut self, circuits: Arc<CircuitBreakerRegistry>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out
    ///
    /// `operation` receives the 1-based attempt number. Errors come back
    /// annotated with the attempt that produced them. Circuit rejections are
    /// returned immediately.
    pub async fn with_retry<F, Fut, T>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, PoolError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let started = Instant::now();
        let mut backoff = policy.backoff_calculator();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match (&policy.circuit, &self.circuits) {
                (Some(name), Some(circuits)) => circuits
                    .call(name, || operation(attempt))
                    .await
                    .map_err(PoolError::from),
                _ => operation(attempt).await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        emit(
                            self.observer.as_ref(),
                            &PoolEvent::RetrySucceeded {
                                attempts: attempt,
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error.with_attempt(attempt),
            };

            if error.is_circuit_rejection() || !error.is_retryable() {
                debug!(attempt, error = %error, "not retrying");
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %error, "retries exhausted");
                emit(
                    self.observer.as_ref(),
                    &PoolEvent::RetryExhausted {
                        attempts: attempt,
                        error: error.to_string(),
                    },
                );
                return Err(error);
            }

            let delay = backoff.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::ErrorKind;
    use crate::testing::CollectingObserver;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_backoff(backoff)
            .with_base_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(false)
    }

    fn retryable() -> PoolError {
        PoolError::checkout_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_exponential_delays() {
        let mut calc = policy(BackoffStrategy::Exponential).backoff_calculator();
        assert_eq!(calc.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(calc.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(calc.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_exponential_with_jitter_stays_within_quarter() {
        let mut calc = policy(BackoffStrategy::Exponential)
            .with_jitter(true)
            .backoff_calculator();
        for _ in 0..100 {
            let first = calc.delay_for_attempt(1);
            assert!(first >= Duration::from_millis(750) && first <= Duration::from_millis(1250));
            let third = calc.delay_for_attempt(3);
            assert!(third >= Duration::from_millis(3000) && third <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn test_linear_and_fibonacci() {
        let mut linear = policy(BackoffStrategy::Linear).backoff_calculator();
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(3));

        let mut fib = policy(BackoffStrategy::Fibonacci).backoff_calculator();
        let delays: Vec<_> = (1..=6).map(|a| fib.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_custom_strategy() {
        let mut calc = policy(BackoffStrategy::custom(|attempt| {
            Duration::from_millis(100 * attempt as u64)
        }))
        .backoff_calculator();
        assert_eq!(calc.delay_for_attempt(4), Duration::from_millis(400));
    }

    #[test]
    fn test_all_delays_bounded() {
        let strategies = [
            BackoffStrategy::Linear,
            BackoffStrategy::Exponential,
            BackoffStrategy::Fibonacci,
            BackoffStrategy::DecorrelatedJitter,
            BackoffStrategy::custom(|attempt| Duration::from_secs(u64::from(attempt) * 1000)),
        ];
        let max = Duration::from_secs(30);
        for strategy in strategies {
            for jitter in [false, true] {
                let mut calc = policy(strategy.clone())
                    .with_max_delay(max)
                    .with_jitter(jitter)
                    .backoff_calculator();
                for attempt in 1..=20 {
                    let delay = calc.delay_for_attempt(attempt);
                    assert!(delay <= max, "{strategy:?} attempt {attempt}: {delay:?}");
                }
            }
        }
    }

    #[test]
    fn test_decorrelated_jitter_range() {
        let mut calc = policy(BackoffStrategy::DecorrelatedJitter)
            .with_max_delay(Duration::from_secs(10))
            .backoff_calculator();
        for attempt in 1..=50 {
            let delay = calc.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_secs(1), "{delay:?}");
            assert!(delay <= Duration::from_secs(10), "{delay:?}");
        }
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "fibonacci".parse::<BackoffStrategy>(),
            Ok(BackoffStrategy::Fibonacci)
        );
        assert_eq!(
            "Decorrelated_Jitter".parse::<BackoffStrategy>(),
            Ok(BackoffStrategy::DecorrelatedJitter)
        );
        assert!("random".parse::<BackoffStrategy>().is_err());
    }

    #[test]
    fn test_policy_serialization() {
        let policy = RetryPolicy::exponential().with_circuit("python");
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let observer = Arc::new(CollectingObserver::new());
        let executor = RetryExecutor::new().with_observer(observer.clone());
        let calls = AtomicU32::new(0);

        let result = executor
            .with_retry(&policy(BackoffStrategy::Linear), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(retryable())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observer.count("retry.succeeded"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let executor = RetryExecutor::new();
        let calls = AtomicU32::new(0);

        let err = executor
            .with_retry(&policy(BackoffStrategy::Linear), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(PoolError::channel_closed("worker exited")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ChannelClosed);
        assert_eq!(err.context.attempt, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_attempt() {
        let observer = Arc::new(CollectingObserver::new());
        let executor = RetryExecutor::new().with_observer(observer.clone());
        let started = Instant::now();

        let err = executor
            .with_retry(
                &policy(BackoffStrategy::Exponential).with_max_attempts(3),
                |_| async { Err::<(), _>(retryable()) },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::CheckoutTimeout);
        assert_eq!(err.context.attempt, Some(3));
        assert_eq!(observer.count("retry.exhausted"), 1);
        // Slept 1s then 2s between the three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_rejection_is_not_retried() {
        let circuits = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        let executor = RetryExecutor::new().with_circuits(circuits.clone());
        let calls = AtomicU32::new(0);

        let err = executor
            .with_retry(
                &policy(BackoffStrategy::Linear)
                    .with_max_attempts(5)
                    .with_circuit("python"),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(retryable()) }
                },
            )
            .await
            .unwrap_err();

        // First attempt fails and opens the circuit; the second is rejected
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(err.context.attempt, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
