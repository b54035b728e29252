//! Circuit breaker
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐  timeout elapsed  ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ────────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                   └──────────┘
//!      ▲                               ▲          any failure        │
//!      │                               └─────────────────────────────┤
//!      │              success threshold                              │
//!      └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each call takes a [`CircuitPermit`]. Half-open probes are counted against
//! `half_open_request_limit`; permits carry the generation of the state they
//! were issued in, so a result that arrives after the circuit has moved on
//! does not count against the new state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::duration_millis;
use crate::error::{ErrorKind, PoolError};
use crate::events::{emit, CallOutcome, EventObserver, NoopEventObserver, PoolEvent};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the dependency recovered - limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use pyfleet_core::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Successes in half-open that close the circuit
    pub success_threshold: u32,

    /// Time since the last failure before an open circuit admits a probe
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Concurrent probes allowed while half-open
    pub half_open_request_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_request_limit: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_half_open_request_limit(mut self, limit: u32) -> Self {
        self.half_open_request_limit = limit.max(1);
        self
    }
}

/// Why a call was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitRejection {
    Open,
    HalfOpenLimit,
}

/// Error from [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit '{0}' is open")]
    Open(String),

    #[error("circuit '{0}' is half-open and all probe slots are taken")]
    HalfOpenLimit(String),

    #[error("{0}")]
    Failed(E),
}

impl From<CircuitError<PoolError>> for PoolError {
    fn from(error: CircuitError<PoolError>) -> Self {
        match error {
            CircuitError::Open(name) => {
                PoolError::new(ErrorKind::CircuitOpen, format!("circuit '{name}' is open"))
                    .with_metadata("circuit", name)
            }
            CircuitError::HalfOpenLimit(name) => PoolError::new(
                ErrorKind::HalfOpenLimit,
                format!("circuit '{name}' is half-open and all probe slots are taken"),
            )
            .with_metadata("circuit", name),
            CircuitError::Failed(inner) => inner,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_at: Option<Instant>,
    last_state_change: Instant,
    generation: u64,
}

impl BreakerState {
    fn move_to(&mut self, next: CircuitState, now: Instant) -> (CircuitState, CircuitState) {
        let previous = self.state;
        self.state = next;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        if next == CircuitState::Closed {
            self.failure_count = 0;
        }
        self.last_state_change = now;
        self.generation += 1;
        (previous, next)
    }
}

/// In-process circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observer: Arc<dyn EventObserver>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                last_failure_at: None,
                last_state_change: Instant::now(),
                generation: 0,
            }),
            observer: Arc::new(NoopEventObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the open timeout
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Time since the last state change
    pub fn time_in_state(&self) -> Duration {
        self.state.lock().last_state_change.elapsed()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_in_flight: state.half_open_in_flight,
        }
    }

    /// Ask to make a call
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitRejection> {
        let now = Instant::now();
        let mut changed = None;

        let admitted = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => Ok((state.generation, false)),
                CircuitState::Open => {
                    let cooled = state
                        .last_failure_at
                        .map_or(true, |at| now.saturating_duration_since(at) >= self.config.timeout);
                    if cooled {
                        changed = Some(state.move_to(CircuitState::HalfOpen, now));
                        state.half_open_in_flight = 1;
                        Ok((state.generation, true))
                    } else {
                        Err(CircuitRejection::Open)
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < self.config.half_open_request_limit {
                        state.half_open_in_flight += 1;
                        Ok((state.generation, true))
                    } else {
                        Err(CircuitRejection::HalfOpenLimit)
                    }
                }
            }
        };

        if let Some((from, to)) = changed {
            self.emit_state_change(from, to);
        }

        match admitted {
            Ok((generation, probe)) => Ok(CircuitPermit {
                breaker: self,
                generation,
                probe,
                started: now,
                settled: false,
            }),
            Err(rejection) => {
                tracing::debug!(circuit = %self.name, ?rejection, "call rejected by circuit");
                emit(
                    self.observer.as_ref(),
                    &PoolEvent::CircuitCall {
                        circuit: self.name.clone(),
                        outcome: CallOutcome::Rejected,
                        duration_ms: 0,
                    },
                );
                Err(rejection)
            }
        }
    }

    /// Run `f` through the breaker
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|rejection| match rejection {
            CircuitRejection::Open => CircuitError::Open(self.name.clone()),
            CircuitRejection::HalfOpenLimit => CircuitError::HalfOpenLimit(self.name.clone()),
        })?;

        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(error) => {
                permit.failure();
                Err(CircuitError::Failed(error))
            }
        }
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let changed = {
            let mut state = self.state.lock();
            state.last_failure_at = None;
            if state.state == CircuitState::Closed {
                state.failure_count = 0;
                None
            } else {
                Some(state.move_to(CircuitState::Closed, Instant::now()))
            }
        };
        if let Some((from, to)) = changed {
            self.emit_state_change(from, to);
        }
    }

    fn settle(&self, generation: u64, probe: bool, outcome: Option<bool>) {
        let now = Instant::now();
        let changed = {
            let mut state = self.state.lock();
            let current = state.generation == generation;
            if probe && current {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match (outcome, state.state) {
                (None, _) => None,
                (Some(true), CircuitState::Closed) if current => {
                    state.failure_count = 0;
                    None
                }
                (Some(true), CircuitState::HalfOpen) if current => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        Some(state.move_to(CircuitState::Closed, now))
                    } else {
                        None
                    }
                }
                (Some(false), CircuitState::Closed) if current => {
                    state.failure_count += 1;
                    state.last_failure_at = Some(now);
                    if state.failure_count >= self.config.failure_threshold {
                        Some(state.move_to(CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                (Some(false), CircuitState::HalfOpen) if current => {
                    state.last_failure_at = Some(now);
                    Some(state.move_to(CircuitState::Open, now))
                }
                // Results from a previous generation
                _ => None,
            }
        };

        if let Some((from, to)) = changed {
            self.emit_state_change(from, to);
        }
    }

    fn emit_state_change(&self, from: CircuitState, to: CircuitState) {
        tracing::info!(circuit = %self.name, %from, %to, "circuit state changed");
        emit(
            self.observer.as_ref(),
            &PoolEvent::CircuitStateChanged {
                circuit: self.name.clone(),
                from,
                to,
            },
        );
    }
}

/// Admission to make one call; report the result with [`success`](Self::success)
/// or [`failure`](Self::failure)
///
/// Dropping an unsettled permit frees its probe slot without counting a result.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    started: Instant,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.finish(true);
    }

    pub fn failure(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, succeeded: bool) {
        self.settled = true;
        self.breaker
            .settle(self.generation, self.probe, Some(succeeded));
        emit(
            self.breaker.observer.as_ref(),
            &PoolEvent::CircuitCall {
                circuit: self.breaker.name.clone(),
                outcome: if succeeded {
                    CallOutcome::Success
                } else {
                    CallOutcome::Failure
                },
                duration_ms: self.started.elapsed().as_millis() as u64,
            },
        );
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, self.probe, None);
        }
    }
}

/// Named breakers created on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    observer: Arc<dyn EventObserver>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            observer: Arc::new(NoopEventObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Breaker for `name`, created with the registry's config if missing
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(name, self.config.clone())
                        .with_observer(Arc::clone(&self.observer)),
                )
            });
        Arc::clone(breaker.value())
    }

    /// Register a breaker with its own config, replacing any existing one
    pub fn insert(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(
            CircuitBreaker::new(name, config).with_observer(Arc::clone(&self.observer)),
        );
        self.breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Run `f` through the breaker named `name`
    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(name);
        breaker.call(f).await
    }

    /// Force a breaker closed; false if it does not exist
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
