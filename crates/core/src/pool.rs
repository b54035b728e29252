//! Pool manager
//!
//! Owns the worker registry and hands out exclusive [`WorkerLease`]s.
//! Checkout and checkin only touch the registry; the caller performs channel
//! I/O on its own task through the lease, so a slow worker never blocks the
//! manager or other callers.
//!
//! Registry changes happen under a single mutex that is never held across an
//! `.await`. Events, terminations and replacement signals produced while the
//! lock is held are collected and dispatched after it is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use pyfleet_protocol::WorkerChannel;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::affinity::{SessionAffinity, DEFAULT_SESSION_TTL, DEFAULT_SWEEP_INTERVAL};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::config::ConfigError;
use crate::duration_millis;
use crate::error::{ErrorKind, PoolError};
use crate::events::{emit, EventObserver, NoopEventObserver, PoolEvent};
use crate::migration::{MigrationRecord, MigrationStatus, MigrationTracker};
use crate::recovery::{
    FailureReason, RecoveryAction, RecoveryConfig, RecoveryContext, RecoveryPolicy,
};
use crate::state_machine::{WorkerHealth, WorkerState};
use crate::worker::{Worker, WorkerInfo, WorkerSpawner};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Prefix for worker ids
    pub name: String,

    /// Target number of workers
    pub size: usize,

    /// Extra workers allowed while every worker is busy
    pub max_overflow: usize,

    /// Start `size` workers before `start` returns
    pub eager_start: bool,

    #[serde(with = "duration_millis")]
    pub checkout_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,

    /// Implicating failures in a row before a worker is removed
    pub max_consecutive_failures: u32,

    /// How long a terminating worker gets to exit before it is killed
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// Zero disables the background health monitor
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    #[serde(with = "duration_millis")]
    pub health_check_timeout: Duration,

    pub health_command: String,
    pub shutdown_command: String,

    #[serde(with = "duration_millis")]
    pub session_ttl: Duration,

    #[serde(with = "duration_millis")]
    pub affinity_sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pyfleet".to_string(),
            size: 2,
            max_overflow: 0,
            eager_start: true,
            checkout_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            max_consecutive_failures: 3,
            shutdown_grace: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_command: "ping".to_string(),
            shutdown_command: "shutdown".to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
            affinity_sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_max_overflow(mut self, max_overflow: usize) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_eager_start(mut self, eager: bool) -> Self {
        self.eager_start = eager;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_affinity_sweep_interval(mut self, interval: Duration) -> Self {
        self.affinity_sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 && self.max_overflow == 0 {
            return Err(ConfigError::invalid("size", "pool must allow at least one worker"));
        }
        if self.name.is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.checkout_timeout.is_zero() {
            return Err(ConfigError::invalid("checkout_timeout", "must be positive"));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::invalid("operation_timeout", "must be positive"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid("max_consecutive_failures", "must be at least 1"));
        }
        if self.session_ttl.is_zero() {
            return Err(ConfigError::invalid("session_ttl", "must be positive"));
        }
        if self.affinity_sweep_interval.is_zero() {
            return Err(ConfigError::invalid("affinity_sweep_interval", "must be positive"));
        }
        if self.health_command.is_empty() {
            return Err(ConfigError::invalid("health_command", "must not be empty"));
        }
        Ok(())
    }
}

// =============================================================================
// Public types
// =============================================================================

/// How a caller wants a worker chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Prefer the worker that last served this session
    Session(String),
    /// Least recently used eligible worker
    AnyWorker,
    /// First eligible worker; no affinity is read or written
    Anonymous,
}

impl CheckoutMode {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Session(session_id.into())
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Session(id) => Some(id),
            _ => None,
        }
    }
}

/// How a lease ended
#[derive(Debug, Clone, PartialEq)]
pub enum CheckinOutcome {
    Ok,
    Error(PoolError),
    /// Discard the worker
    Close,
}

/// Signal that a removed worker should be replaced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementRequest {
    pub worker_id: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub recovered: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub size: usize,
    pub max_overflow: usize,
    pub workers: usize,
    pub overflow_workers: usize,
    pub available: usize,
    pub pending_spawns: usize,
    pub by_state: BTreeMap<String, usize>,
    pub active_sessions: usize,
    pub migrations_in_progress: usize,
    pub correlation_anomalies: u64,
    pub circuits: Vec<CircuitSnapshot>,
    pub shutting_down: bool,
}

// =============================================================================
// Registry internals
// =============================================================================

#[derive(Default)]
struct Registry {
    workers: BTreeMap<String, Worker>,
    pending_spawns: usize,
    next_index: u64,
    shutting_down: bool,
}

impl Registry {
    fn live(&self) -> usize {
        self.workers.len() + self.pending_spawns
    }
}

/// Side effects collected under the registry lock
#[derive(Default)]
struct Effects {
    events: Vec<PoolEvent>,
    terminate: Vec<Worker>,
    replacements: Vec<ReplacementRequest>,
    notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnPurpose {
    /// A checkout found nothing eligible
    Demand,
    /// Startup or replacement, up to `size`
    Provision,
}

enum CheckoutStep {
    Leased(WorkerLease),
    Grow { worker_id: String, overflow: bool },
    Retry,
    Wait,
}

fn transition(worker: &mut Worker, to: WorkerState, reason: &str, fx: &mut Effects) -> bool {
    match worker.machine.transition(to, reason, BTreeMap::new()) {
        Ok(record) => {
            debug!(worker_id = %worker.id, from = %record.from, to = %record.to, reason, "worker transition");
            fx.events.push(PoolEvent::StateTransition {
                worker_id: worker.id.clone(),
                from: record.from,
                to: record.to,
                reason: record.reason,
            });
            true
        }
        Err(e) => {
            warn!(error = %e, reason, "rejected worker transition");
            false
        }
    }
}

fn note_anomalies(worker: &mut Worker, fx: &mut Effects) {
    let total = worker.channel.correlation_anomalies();
    if total > worker.reported_anomalies {
        worker.reported_anomalies = total;
        fx.events.push(PoolEvent::CorrelationAnomaly {
            worker_id: worker.id.clone(),
            total,
        });
    }
}

fn select_worker(workers: &BTreeMap<String, Worker>, mode: &CheckoutMode) -> Option<String> {
    let mut eligible = workers.values().filter(|w| w.available());
    match mode {
        CheckoutMode::Anonymous => eligible.next().map(|w| w.id.clone()),
        CheckoutMode::AnyWorker | CheckoutMode::Session(_) => eligible
            .min_by_key(|w| w.last_used)
            .map(|w| w.id.clone()),
    }
}

struct PoolInner {
    config: PoolConfig,
    recovery: RecoveryPolicy,
    spawner: Arc<dyn WorkerSpawner>,
    registry: Mutex<Registry>,
    available: Notify,
    affinity: Arc<SessionAffinity>,
    migrations: MigrationTracker,
    circuits: Arc<CircuitBreakerRegistry>,
    observer: Arc<dyn EventObserver>,
    replacements_tx: mpsc::UnboundedSender<ReplacementRequest>,
    replacements_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplacementRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    terminations: Mutex<Vec<JoinHandle<()>>>,
    /// Anomalies seen on channels of workers that are gone
    retired_anomalies: AtomicU64,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl PoolInner {
    fn apply(self: &Arc<Self>, fx: Effects) {
        for event in &fx.events {
            emit(self.observer.as_ref(), event);
        }
        for worker in fx.terminate {
            self.spawn_termination(worker);
        }
        for request in fx.replacements {
            if self.replacements_tx.send(request).is_err() {
                debug!("replacement receiver dropped");
            }
        }
        if fx.notify {
            self.available.notify_waiters();
        }
    }

    // -------------------------------------------------------------------------
    // Growth
    // -------------------------------------------------------------------------

    /// Whether a worker may be started, and if so whether it is overflow
    fn spawn_slot(&self, reg: &Registry, purpose: SpawnPurpose) -> Option<bool> {
        if reg.shutting_down {
            return None;
        }
        let live = reg.live();
        let size = self.config.size;
        match purpose {
            SpawnPurpose::Demand => {
                if live >= size + self.config.max_overflow {
                    None
                } else if live >= size {
                    Some(true)
                } else if self.config.eager_start {
                    // Base workers of an eager pool come back through replacement
                    None
                } else {
                    Some(false)
                }
            }
            SpawnPurpose::Provision => (live < size).then_some(false),
        }
    }

    fn reserve_spawn(&self, reg: &mut Registry, purpose: SpawnPurpose) -> Option<(String, bool)> {
        let overflow = self.spawn_slot(reg, purpose)?;
        reg.pending_spawns += 1;
        reg.next_index += 1;
        Some((format!("{}-{}", self.config.name, reg.next_index), overflow))
    }

    /// Start a worker whose slot was reserved with `reserve_spawn`
    async fn start_worker(self: &Arc<Self>, worker_id: String, overflow: bool) -> Result<String, PoolError> {
        let started = Instant::now();
        let result = self.spawner.spawn(&worker_id).await;

        let mut fx = Effects::default();
        let outcome = {
            let mut reg = self.registry.lock();
            reg.pending_spawns = reg.pending_spawns.saturating_sub(1);
            match result {
                Ok(spawned) => {
                    let mut worker = Worker::new(worker_id.clone(), spawned, overflow);
                    worker.machine.update_health(WorkerHealth::Healthy);
                    transition(&mut worker, WorkerState::Ready, "worker started", &mut fx);
                    fx.events.push(PoolEvent::WorkerCreated {
                        worker_id: worker_id.clone(),
                        overflow,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    if reg.shutting_down {
                        transition(&mut worker, WorkerState::Terminating, "pool shutting down", &mut fx);
                        fx.terminate.push(worker);
                        Err(PoolError::pool_unavailable("pool is shutting down").with_worker(worker_id))
                    } else {
                        info!(worker_id = %worker_id, overflow, pid = ?worker.process.pid(), "worker started");
                        reg.workers.insert(worker_id.clone(), worker);
                        fx.notify = true;
                        Ok(worker_id)
                    }
                }
                Err(error) => {
                    warn!(worker_id = %worker_id, error = %error, "worker failed to start");
                    fx.events.push(PoolEvent::WorkerSpawnFailed {
                        worker_id: worker_id.clone(),
                        error: error.to_string(),
                    });
                    Err(error.with_worker(worker_id))
                }
            }
        };
        self.apply(fx);
        outcome
    }

    /// Run `start_worker` on its own task so an abandoned caller cannot
    /// leak the reserved slot
    async fn start_detached(self: &Arc<Self>, worker_id: String, overflow: bool) -> Result<String, PoolError> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.start_worker(worker_id, overflow).await })
            .await
            .map_err(|e| PoolError::unexpected(format!("worker start task failed: {e}")))?
    }

    // -------------------------------------------------------------------------
    // Checkout / checkin
    // -------------------------------------------------------------------------

    fn try_checkout(self: &Arc<Self>, mode: &CheckoutMode) -> Result<CheckoutStep, PoolError> {
        let mut fx = Effects::default();
        let step = {
            let mut reg = self.registry.lock();
            if reg.shutting_down {
                return Err(PoolError::pool_unavailable("pool is shutting down"));
            }

            let session = mode.session_id();
            let hinted = session.and_then(|s| self.affinity.lookup(s).ok());
            let preferred = hinted
                .clone()
                .filter(|id| reg.workers.get(id).is_some_and(|w| w.available()));

            let chosen = preferred.or_else(|| select_worker(&reg.workers, mode));
            match chosen {
                Some(worker_id) => self.lease_locked(&mut reg, worker_id, session, hinted, &mut fx),
                None => match self.reserve_spawn(&mut reg, SpawnPurpose::Demand) {
                    Some((worker_id, overflow)) => CheckoutStep::Grow { worker_id, overflow },
                    None => CheckoutStep::Wait,
                },
            }
        };
        self.apply(fx);
        Ok(step)
    }

    fn lease_locked(
        self: &Arc<Self>,
        reg: &mut Registry,
        worker_id: String,
        session: Option<&str>,
        hinted: Option<String>,
        fx: &mut Effects,
    ) -> CheckoutStep {
        let Some(worker) = reg.workers.get_mut(&worker_id) else {
            return CheckoutStep::Retry;
        };

        if !worker.channel.is_open() {
            let reason = FailureReason::CheckoutConnectionFailed {
                reason: worker.channel.close_reason().unwrap_or_default(),
            };
            self.recover_locked(reg, &worker_id, reason, fx);
            return CheckoutStep::Retry;
        }
        if !transition(worker, WorkerState::Busy, "checkout", fx) {
            self.recover_locked(reg, &worker_id, FailureReason::NotReadyAtCheckout, fx);
            return CheckoutStep::Retry;
        }
        worker.stats.checkouts += 1;
        worker.last_used = Instant::now();
        let channel = Arc::clone(&worker.channel);

        let mut migration = None;
        if let Some(session) = session {
            if let Some(previous) = hinted.filter(|previous| previous != &worker_id) {
                let record = self.migrations.start(session, &previous, &worker_id);
                info!(session_id = session, from = %previous, to = %worker_id, "session migrated");
                fx.events.push(PoolEvent::SessionMigrated {
                    migration_id: record.id,
                    session_id: record.session_id,
                    from_worker: record.from_worker,
                    to_worker: record.to_worker,
                    status: record.status,
                });
                migration = Some(record.id);
            }
            self.affinity.bind(session, &worker_id);
        }

        debug!(worker_id = %worker_id, session_id = ?session, "worker checked out");
        CheckoutStep::Leased(WorkerLease {
            inner: Arc::clone(self),
            worker_id,
            session_id: session.map(str::to_string),
            channel,
            migration,
            in_flight: AtomicUsize::new(0),
            checked_in: false,
        })
    }

    fn checkin(self: &Arc<Self>, lease: &WorkerLease, outcome: CheckinOutcome) {
        let mut fx = Effects::default();
        {
            let mut reg = self.registry.lock();
            let size = self.config.size;
            let worker_count = reg.workers.len();
            let worker_id = lease.worker_id.as_str();

            let migration_error = match reg.workers.get_mut(worker_id) {
                None => {
                    debug!(worker_id, "checkin for a worker no longer in the pool");
                    Some("worker removed before checkin".to_string())
                }
                Some(worker) => {
                    worker.last_used = Instant::now();
                    note_anomalies(worker, &mut fx);
                    let busy = worker.machine.state() == WorkerState::Busy;

                    let failure = match &outcome {
                        CheckinOutcome::Ok => {
                            worker.stats.successful_checkins += 1;
                            worker.consecutive_failures = 0;
                            None
                        }
                        // The worker answered; only the command failed
                        CheckinOutcome::Error(error) if !error.implicates_worker() => {
                            worker.stats.error_checkins += 1;
                            worker.consecutive_failures = 0;
                            None
                        }
                        CheckinOutcome::Error(error) => {
                            worker.stats.error_checkins += 1;
                            worker.consecutive_failures += 1;
                            if error.kind == ErrorKind::OperationTimeout {
                                worker.stats.timeouts += 1;
                            }
                            Some(if !worker.channel.is_open() {
                                FailureReason::ChannelExited {
                                    reason: worker.channel.close_reason().unwrap_or_default(),
                                }
                            } else if worker.consecutive_failures >= self.config.max_consecutive_failures {
                                FailureReason::MaxFailuresExceeded {
                                    failures: worker.consecutive_failures,
                                }
                            } else {
                                FailureReason::from_error(error.clone())
                            })
                        }
                        CheckinOutcome::Close => None,
                    };

                    if outcome == CheckinOutcome::Close {
                        let replace = self.recovery.config().replace_removed_workers;
                        self.remove_locked(&mut reg, worker_id, "closed at checkin".to_string(), replace, &mut fx);
                        Some("worker closed at checkin".to_string())
                    } else if !busy {
                        debug!(worker_id, "checkin for a worker that is no longer busy");
                        failure.map(|reason| reason.describe())
                    } else if let Some(reason) = failure {
                        let description = reason.describe();
                        self.recover_locked(&mut reg, worker_id, reason, &mut fx);
                        Some(description)
                    } else if !worker.channel.is_open() {
                        let reason = FailureReason::ChannelExited {
                            reason: worker.channel.close_reason().unwrap_or_default(),
                        };
                        let description = reason.describe();
                        self.recover_locked(&mut reg, worker_id, reason, &mut fx);
                        Some(description)
                    } else if worker.overflow && worker_count > size {
                        self.remove_locked(&mut reg, worker_id, "overflow worker retired".to_string(), false, &mut fx);
                        None
                    } else {
                        transition(worker, WorkerState::Ready, "checkin", &mut fx);
                        if let Some(session) = &lease.session_id {
                            // Refresh the TTL of a session served successfully
                            self.affinity.bind(session, worker_id);
                        }
                        fx.notify = true;
                        None
                    }
                }
            };

            if let Some(id) = lease.migration {
                let finished = match migration_error {
                    None => self.migrations.complete(id),
                    Some(error) => self.migrations.fail(id, error),
                };
                match finished {
                    Ok(record) => fx.events.push(PoolEvent::SessionMigrated {
                        migration_id: record.id,
                        session_id: record.session_id,
                        from_worker: record.from_worker,
                        to_worker: record.to_worker,
                        status: record.status,
                    }),
                    Err(e) => debug!(error = %e, "migration already finished"),
                }
            }
        }
        self.apply(fx);
    }

    fn exhausted_error(&self, mode: &CheckoutMode) -> PoolError {
        let error = {
            let reg = self.registry.lock();
            if reg.shutting_down {
                PoolError::pool_unavailable("pool is shutting down")
            } else if reg.live() == 0 && self.spawn_slot(&reg, SpawnPurpose::Demand).is_none() {
                PoolError::pool_unavailable("pool exhausted: no live workers and no capacity to start one")
            } else {
                PoolError::checkout_timeout(self.config.checkout_timeout)
            }
        };
        match mode.session_id() {
            Some(session) => error.with_session(session),
            None => error,
        }
    }

    // -------------------------------------------------------------------------
    // Recovery and removal
    // -------------------------------------------------------------------------

    fn recover_locked(
        self: &Arc<Self>,
        reg: &mut Registry,
        worker_id: &str,
        reason: FailureReason,
        fx: &mut Effects,
    ) -> Option<RecoveryAction> {
        let worker = reg.workers.get(worker_id)?;
        let context = RecoveryContext {
            consecutive_health_failures: worker.health_failures,
            shutting_down: reg.shutting_down,
        };
        let strategy = self
            .recovery
            .determine_strategy(&reason, worker.machine.state(), &context);
        let description = reason.describe();

        fx.events.push(PoolEvent::RecoveryDecided {
            worker_id: worker_id.to_string(),
            action: strategy.action,
            delay_ms: strategy.delay.as_millis() as u64,
            reason: description.clone(),
        });

        match strategy.action {
            RecoveryAction::Retry | RecoveryAction::Degrade => {
                let worker = reg.workers.get_mut(worker_id)?;
                if worker.machine.state() != WorkerState::Degraded {
                    transition(worker, WorkerState::Degraded, &description, fx);
                }
                let health = if strategy.action == RecoveryAction::Degrade {
                    WorkerHealth::Unhealthy
                } else {
                    WorkerHealth::Unknown
                };
                worker.machine.update_health(health);
                worker.recover_after = Some(Instant::now() + strategy.delay);
                warn!(
                    worker_id,
                    action = %strategy.action,
                    delay_ms = strategy.delay.as_millis() as u64,
                    reason = %description,
                    "worker cooling down"
                );
            }
            RecoveryAction::Remove => {
                self.remove_locked(reg, worker_id, description, false, fx);
            }
            RecoveryAction::Replace => {
                self.remove_locked(reg, worker_id, description, true, fx);
            }
        }
        Some(strategy.action)
    }

    /// Take a worker out of the registry and queue its termination
    ///
    /// Affinity for the worker is cleared before anything else so no new
    /// checkout can be routed to it.
    fn remove_locked(
        &self,
        reg: &mut Registry,
        worker_id: &str,
        reason: String,
        replace: bool,
        fx: &mut Effects,
    ) -> bool {
        let Some(mut worker) = reg.workers.remove(worker_id) else {
            return false;
        };
        let cleared = self.affinity.remove_all_for_worker(worker_id);
        transition(&mut worker, WorkerState::Terminating, &reason, fx);
        info!(worker_id, reason = %reason, sessions_cleared = cleared, "worker removed");

        fx.events.push(PoolEvent::WorkerRemoved {
            worker_id: worker_id.to_string(),
            reason: reason.clone(),
        });
        if replace && !reg.shutting_down {
            fx.events.push(PoolEvent::ReplacementRequested {
                worker_id: worker_id.to_string(),
                reason: reason.clone(),
            });
            fx.replacements.push(ReplacementRequest {
                worker_id: worker_id.to_string(),
                reason,
                requested_at: Utc::now(),
            });
        }
        fx.terminate.push(worker);
        fx.notify = true;
        true
    }

    fn spawn_termination(self: &Arc<Self>, worker: Worker) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(worker_id = %worker.id, "no runtime available; dropping worker");
            return;
        };
        let inner = Arc::clone(self);
        let task = runtime.spawn(async move { inner.terminate(worker).await });
        let mut terminations = self.terminations.lock();
        terminations.retain(|t| !t.is_finished());
        terminations.push(task);
    }

    /// Shutdown command, close, wait for exit, kill if needed
    async fn terminate(&self, mut worker: Worker) {
        let grace = self.config.shutdown_grace;
        if worker.channel.is_open() {
            if let Err(e) = worker
                .channel
                .call(&self.config.shutdown_command, &json!({}), grace)
                .await
            {
                debug!(worker_id = %worker.id, error = %e, "shutdown command not acknowledged");
            }
        }
        worker.channel.close("worker terminated").await;

        let graceful = worker.process.wait_exit(grace).await;
        if !graceful {
            warn!(worker_id = %worker.id, ?grace, "worker did not exit in time; killing");
            worker.process.kill().await;
        }
        self.retired_anomalies
            .fetch_add(worker.channel.correlation_anomalies(), Ordering::Relaxed);

        let reason = if graceful { "exited" } else { "killed" };
        if let Ok(record) = worker
            .machine
            .transition(WorkerState::Terminated, reason, BTreeMap::new())
        {
            emit(
                self.observer.as_ref(),
                &PoolEvent::StateTransition {
                    worker_id: worker.id.clone(),
                    from: record.from,
                    to: record.to,
                    reason: record.reason,
                },
            );
        }
        emit(
            self.observer.as_ref(),
            &PoolEvent::WorkerTerminated {
                worker_id: worker.id.clone(),
                graceful,
            },
        );
        info!(worker_id = %worker.id, graceful, "worker terminated");
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    async fn health_check_all(self: &Arc<Self>) -> HealthReport {
        let now = Instant::now();
        let targets: Vec<(String, Arc<WorkerChannel>)> = {
            let mut reg = self.registry.lock();
            reg.workers
                .values_mut()
                .filter(|w| {
                    !w.probing
                        && match w.machine.state() {
                            WorkerState::Ready => true,
                            WorkerState::Degraded => w.recover_after.map_or(true, |at| at <= now),
                            _ => false,
                        }
                })
                .map(|w| {
                    w.probing = true;
                    (w.id.clone(), Arc::clone(&w.channel))
                })
                .collect()
        };
        let probing = ProbeGuard {
            inner: self,
            worker_ids: targets.iter().map(|(id, _)| id.clone()).collect(),
        };

        let command = self.config.health_command.as_str();
        let timeout = self.config.health_check_timeout;
        let probes = targets.into_iter().map(|(worker_id, channel)| async move {
            let started = Instant::now();
            let result = channel
                .call(command, &json!({}), timeout)
                .await
                .map_err(PoolError::from);
            (worker_id, result, started.elapsed())
        });
        let results = join_all(probes).await;

        let mut report = HealthReport::default();
        let mut fx = Effects::default();
        {
            let mut reg = self.registry.lock();
            for (worker_id, result, elapsed) in results {
                let Some(worker) = reg.workers.get_mut(&worker_id) else {
                    continue;
                };
                worker.probing = false;
                let state = worker.machine.state();
                // Removed while the probe was in flight
                if !matches!(state, WorkerState::Ready | WorkerState::Degraded) {
                    continue;
                }
                report.checked += 1;
                worker.stats.health_checks += 1;
                note_anomalies(worker, &mut fx);

                match result {
                    Ok(_) => {
                        report.healthy += 1;
                        worker.health_failures = 0;
                        worker.recover_after = None;
                        worker.machine.update_health(WorkerHealth::Healthy);
                        fx.events.push(PoolEvent::HealthCheck {
                            worker_id: worker_id.clone(),
                            healthy: true,
                            duration_ms: elapsed.as_millis() as u64,
                            error: None,
                        });
                        if state == WorkerState::Degraded {
                            transition(worker, WorkerState::Ready, "health check passed", &mut fx);
                            report.recovered += 1;
                        }
                        fx.notify = true;
                    }
                    Err(error) => {
                        worker.stats.health_failures += 1;
                        worker.health_failures += 1;
                        fx.events.push(PoolEvent::HealthCheck {
                            worker_id: worker_id.clone(),
                            healthy: false,
                            duration_ms: elapsed.as_millis() as u64,
                            error: Some(error.to_string()),
                        });
                        let reason = if worker.channel.is_open() {
                            FailureReason::HealthCheckFailed(error)
                        } else {
                            FailureReason::ChannelExited {
                                reason: worker.channel.close_reason().unwrap_or_default(),
                            }
                        };
                        match self.recover_locked(&mut reg, &worker_id, reason, &mut fx) {
                            Some(action) if action.removes_worker() => report.removed += 1,
                            _ => report.unhealthy += 1,
                        }
                    }
                }
            }
        }
        drop(probing);
        self.apply(fx);
        debug!(?report, "health check complete");
        report
    }
}

/// Returns probed workers to rotation, also when a health check is abandoned
struct ProbeGuard<'a> {
    inner: &'a Arc<PoolInner>,
    worker_ids: Vec<String>,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.worker_ids.is_empty() {
            return;
        }
        {
            let mut reg = self.inner.registry.lock();
            for worker_id in &self.worker_ids {
                if let Some(worker) = reg.workers.get_mut(worker_id) {
                    worker.probing = false;
                }
            }
        }
        self.inner.available.notify_waiters();
    }
}

fn spawn_health_monitor(
    pool: Weak<PoolInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else {
                        break;
                    };
                    inner.health_check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// =============================================================================
// Pool
// =============================================================================

/// Builder returned by [`Pool::builder`]
pub struct PoolBuilder {
    spawner: Arc<dyn WorkerSpawner>,
    config: PoolConfig,
    recovery: RecoveryConfig,
    observer: Arc<dyn EventObserver>,
    circuits: Option<Arc<CircuitBreakerRegistry>>,
}

impl PoolBuilder {
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a circuit registry with other components
    pub fn with_circuits(mut self, circuits: Arc<CircuitBreakerRegistry>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    /// Validate the config, start background tasks and, for an eager pool,
    /// the initial workers
    ///
    /// An eager pool fails to start only when none of its workers start.
    pub async fn start(self) -> Result<Pool, PoolError> {
        self.config
            .validate()
            .map_err(|e| PoolError::unexpected(format!("invalid pool config: {e}")))?;

        let (shutdown_tx, _) = watch::channel(false);
        let (replacements_tx, replacements_rx) = mpsc::unbounded_channel();
        let observer = self.observer;
        let circuits = self.circuits.unwrap_or_else(|| {
            Arc::new(CircuitBreakerRegistry::default().with_observer(Arc::clone(&observer)))
        });

        let inner = Arc::new(PoolInner {
            affinity: Arc::new(SessionAffinity::new(self.config.session_ttl)),
            config: self.config,
            recovery: RecoveryPolicy::new(self.recovery),
            spawner: self.spawner,
            registry: Mutex::new(Registry::default()),
            available: Notify::new(),
            migrations: MigrationTracker::new(),
            circuits,
            observer,
            replacements_tx,
            replacements_rx: Mutex::new(Some(replacements_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
            retired_anomalies: AtomicU64::new(0),
        });
        let pool = Pool { inner };
        pool.spawn_background_tasks();

        let config = &pool.inner.config;
        if config.eager_start && config.size > 0 {
            let slots: Vec<_> = {
                let mut reg = pool.inner.registry.lock();
                (0..config.size)
                    .filter_map(|_| pool.inner.reserve_spawn(&mut reg, SpawnPurpose::Provision))
                    .collect()
            };
            let results = join_all(
                slots
                    .into_iter()
                    .map(|(worker_id, overflow)| pool.inner.start_worker(worker_id, overflow)),
            )
            .await;

            let started = results.iter().filter(|r| r.is_ok()).count();
            if started == 0 {
                let error = results
                    .into_iter()
                    .find_map(Result::err)
                    .unwrap_or_else(|| PoolError::worker_init_failed("no workers started"));
                pool.shutdown().await;
                return Err(error);
            }
            if started < config.size {
                warn!(started, size = config.size, "pool started below target size");
                if pool.inner.recovery.config().replace_removed_workers {
                    for error in results.iter().filter_map(|r| r.as_ref().err()) {
                        let request = ReplacementRequest {
                            worker_id: error.context.worker_id.clone().unwrap_or_default(),
                            reason: error.to_string(),
                            requested_at: Utc::now(),
                        };
                        let _ = pool.inner.replacements_tx.send(request);
                    }
                }
            }
        }

        info!(
            pool = %config.name,
            size = config.size,
            max_overflow = config.max_overflow,
            eager_start = config.eager_start,
            "pool started"
        );
        Ok(pool)
    }
}

/// Handle to a running pool; cheap to clone
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.config.name)
            .field("size", &self.inner.config.size)
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn builder(spawner: Arc<dyn WorkerSpawner>) -> PoolBuilder {
        PoolBuilder {
            spawner,
            config: PoolConfig::default(),
            recovery: RecoveryConfig::default(),
            observer: Arc::new(NoopEventObserver),
            circuits: None,
        }
    }

    fn spawn_background_tasks(&self) {
        let config = &self.inner.config;
        let mut tasks = vec![self
            .inner
            .affinity
            .spawn_sweeper(config.affinity_sweep_interval, self.inner.shutdown_tx.subscribe())];
        if !config.health_check_interval.is_zero() {
            tasks.push(spawn_health_monitor(
                Arc::downgrade(&self.inner),
                config.health_check_interval,
                self.inner.shutdown_tx.subscribe(),
            ));
        }
        *self.inner.tasks.lock() = tasks;
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn circuits(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.inner.circuits)
    }

    pub fn observer(&self) -> Arc<dyn EventObserver> {
        Arc::clone(&self.inner.observer)
    }

    pub fn affinity(&self) -> &SessionAffinity {
        &self.inner.affinity
    }

    /// Worker currently bound to a session, if the binding is live
    pub fn session_worker(&self, session_id: &str) -> Option<String> {
        self.inner.affinity.lookup(session_id).ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.registry.lock().shutting_down
    }

    /// Receiver that flips to true when shutdown starts
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Replacement signals; can be taken once
    pub fn take_replacement_requests(&self) -> Option<mpsc::UnboundedReceiver<ReplacementRequest>> {
        self.inner.replacements_rx.lock().take()
    }

    /// Exclusive lease on an eligible worker
    ///
    /// Waits up to `checkout_timeout`. Fails with `pool_unavailable` when the
    /// pool is shutting down or has no live worker and cannot start one, and
    /// with `checkout_timeout` otherwise.
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn checkout(&self, mode: CheckoutMode) -> Result<WorkerLease, PoolError> {
        let deadline = Instant::now() + self.inner.config.checkout_timeout;
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.try_checkout(&mode)? {
                CheckoutStep::Leased(lease) => return Ok(lease),
                CheckoutStep::Retry => continue,
                CheckoutStep::Grow { worker_id, overflow } => {
                    match self.inner.start_detached(worker_id, overflow).await {
                        Ok(_) => continue,
                        Err(error) => {
                            if self.inner.registry.lock().live() == 0 {
                                return Err(match mode.session_id() {
                                    Some(session) => error.with_session(session),
                                    None => error,
                                });
                            }
                        }
                    }
                }
                CheckoutStep::Wait => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let error = self.inner.exhausted_error(&mode);
                debug!(error = %error, "checkout gave up");
                return Err(error);
            }
        }
    }

    /// Return a lease; equivalent to [`WorkerLease::checkin`]
    pub fn checkin(&self, lease: WorkerLease, outcome: CheckinOutcome) {
        lease.checkin(outcome);
    }

    /// Checkout, run one command, checkin
    #[instrument(skip(self, args), fields(pool = %self.inner.config.name))]
    pub async fn execute(&self, mode: CheckoutMode, command: &str, args: Value) -> Result<Value, PoolError> {
        let lease = self.checkout(mode).await?;
        match lease.execute(command, &args).await {
            Ok(result) => {
                lease.checkin(CheckinOutcome::Ok);
                Ok(result)
            }
            Err(error) => {
                lease.checkin(CheckinOutcome::Error(error.clone()));
                Err(error)
            }
        }
    }

    /// Probe idle workers and cooled-down degraded workers
    pub async fn health_check_all(&self) -> HealthReport {
        self.inner.health_check_all().await
    }

    /// Remove a worker and wait for it to terminate; false if unknown
    pub async fn remove_worker(&self, worker_id: &str, reason: &str) -> bool {
        let mut fx = Effects::default();
        let removed = {
            let mut reg = self.inner.registry.lock();
            let replace = self.inner.recovery.config().replace_removed_workers;
            self.inner
                .remove_locked(&mut reg, worker_id, reason.to_string(), replace, &mut fx)
        };
        let workers = std::mem::take(&mut fx.terminate);
        self.inner.apply(fx);
        for worker in workers {
            self.inner.terminate(worker).await;
        }
        removed
    }

    /// Start one worker if the pool is below `size`
    ///
    /// Returns the new worker's id, or `None` when the pool is already at size.
    pub async fn provision_worker(&self) -> Result<Option<String>, PoolError> {
        let slot = {
            let mut reg = self.inner.registry.lock();
            if reg.shutting_down {
                return Err(PoolError::pool_unavailable("pool is shutting down"));
            }
            self.inner.reserve_spawn(&mut reg, SpawnPurpose::Provision)
        };
        match slot {
            Some((worker_id, overflow)) => self.inner.start_detached(worker_id, overflow).await.map(Some),
            None => Ok(None),
        }
    }

    /// Forget a session's affinity
    pub fn end_session(&self, session_id: &str) -> bool {
        self.inner.affinity.unbind(session_id)
    }

    pub fn migrations(&self) -> Vec<MigrationRecord> {
        self.inner.migrations.list()
    }

    /// Rebind a migrated session to its source worker
    pub fn rollback_migration(&self, migration_id: Uuid) -> Result<MigrationRecord, PoolError> {
        let record = self
            .inner
            .migrations
            .get(migration_id)
            .ok_or_else(|| PoolError::unexpected(format!("migration {migration_id} not found")))?;

        let rolled_back = {
            // Held until the hint is bound so the source cannot be removed in between
            let reg = self.inner.registry.lock();
            let source_usable = reg.workers.get(&record.from_worker).is_some_and(|w| {
                matches!(w.machine.state(), WorkerState::Ready | WorkerState::Busy)
                    && w.machine.health() != WorkerHealth::Unhealthy
            });
            if !source_usable {
                return Err(PoolError::pool_unavailable(format!(
                    "source worker {} is no longer available",
                    record.from_worker
                ))
                .with_session(&record.session_id)
                .with_worker(&record.from_worker));
            }

            let rolled_back = self
                .inner
                .migrations
                .mark_rolled_back(migration_id)
                .map_err(|e| PoolError::unexpected(e.to_string()))?;
            self.inner
                .affinity
                .bind(&rolled_back.session_id, &rolled_back.from_worker);
            rolled_back
        };
        info!(
            session_id = %rolled_back.session_id,
            worker_id = %rolled_back.from_worker,
            "session migration rolled back"
        );
        emit(
            self.inner.observer.as_ref(),
            &PoolEvent::SessionMigrated {
                migration_id: rolled_back.id,
                session_id: rolled_back.session_id.clone(),
                from_worker: rolled_back.from_worker.clone(),
                to_worker: rolled_back.to_worker.clone(),
                status: MigrationStatus::RolledBack,
            },
        );
        Ok(rolled_back)
    }

    pub fn status(&self) -> PoolStatus {
        let reg = self.inner.registry.lock();
        let mut by_state = BTreeMap::new();
        let mut anomalies = self.inner.retired_anomalies.load(Ordering::Relaxed);
        for worker in reg.workers.values() {
            *by_state
                .entry(worker.machine.state().as_str().to_string())
                .or_insert(0) += 1;
            anomalies += worker.channel.correlation_anomalies();
        }
        PoolStatus {
            name: self.inner.config.name.clone(),
            size: self.inner.config.size,
            max_overflow: self.inner.config.max_overflow,
            workers: reg.workers.len(),
            overflow_workers: reg.workers.values().filter(|w| w.overflow).count(),
            available: reg
                .workers
                .values()
                .filter(|w| w.available())
                .count(),
            pending_spawns: reg.pending_spawns,
            by_state,
            active_sessions: self.inner.affinity.len(),
            migrations_in_progress: self
                .inner
                .migrations
                .list()
                .iter()
                .filter(|m| !m.status.is_finished())
                .count(),
            correlation_anomalies: anomalies,
            circuits: self.inner.circuits.snapshots(),
            shutting_down: reg.shutting_down,
        }
    }

    pub fn worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        let reg = self.inner.registry.lock();
        reg.workers
            .get(worker_id)
            .map(|w| w.info(self.inner.affinity.sessions_for_worker(worker_id)))
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let reg = self.inner.registry.lock();
        reg.workers
            .values()
            .map(|w| w.info(self.inner.affinity.sessions_for_worker(&w.id)))
            .collect()
    }

    /// Stop background tasks, terminate every worker and clear affinity
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn shutdown(&self) {
        let mut fx = Effects::default();
        let workers: Vec<Worker> = {
            let mut reg = self.inner.registry.lock();
            if reg.shutting_down {
                return;
            }
            reg.shutting_down = true;
            let mut workers: Vec<Worker> = std::mem::take(&mut reg.workers).into_values().collect();
            for worker in &mut workers {
                transition(worker, WorkerState::Terminating, "pool shutdown", &mut fx);
            }
            workers
        };
        info!(workers = workers.len(), "shutting down pool");

        self.inner.shutdown_tx.send_replace(true);
        self.inner.affinity.clear();
        fx.notify = true;
        self.inner.apply(fx);

        join_all(workers.into_iter().map(|w| self.inner.terminate(w))).await;

        let pending: Vec<_> = self.inner.terminations.lock().drain(..).collect();
        for task in pending {
            let _ = task.await;
        }
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("pool shut down");
    }
}

// =============================================================================
// WorkerLease
// =============================================================================

/// Exclusive use of one worker until checkin
///
/// Dropping a lease without checkin returns the worker as `Ok`, or closes it
/// when a request was abandoned mid-flight.
pub struct WorkerLease {
    inner: Arc<PoolInner>,
    worker_id: String,
    session_id: Option<String>,
    channel: Arc<WorkerChannel>,
    migration: Option<Uuid>,
    /// Calls made through this lease that have not returned
    in_flight: AtomicUsize,
    checked_in: bool,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id)
            .field("session_id", &self.session_id)
            .field("migration", &self.migration)
            .finish()
    }
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Migration started by this checkout, if the session moved
    pub fn migration_id(&self) -> Option<Uuid> {
        self.migration
    }

    /// Send a command with the pool's operation timeout
    pub async fn execute(&self, command: &str, args: &Value) -> Result<Value, PoolError> {
        self.execute_with_timeout(command, args, self.inner.config.operation_timeout)
            .await
    }

    #[instrument(skip(self, args), fields(worker_id = %self.worker_id, session_id = ?self.session_id))]
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value, PoolError> {
        let started = Instant::now();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.channel.call(command, args, timeout).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                debug!(duration_ms, "command completed");
                Ok(value)
            }
            Err(e) => {
                let mut error = PoolError::from(e)
                    .with_worker(&self.worker_id)
                    .with_command(command);
                if let Some(session) = &self.session_id {
                    error = error.with_session(session);
                }
                debug!(duration_ms, error = %error, "command failed");
                Err(error)
            }
        }
    }

    pub fn checkin(mut self, outcome: CheckinOutcome) {
        self.checked_in = true;
        self.inner.checkin(&self, outcome);
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.checked_in {
            return;
        }
        let outcome = if self.in_flight.load(Ordering::SeqCst) > 0 {
            CheckinOutcome::Close
        } else {
            CheckinOutcome::Ok
        };
        debug!(worker_id = %self.worker_id, ?outcome, "lease dropped without checkin");
        self.inner.checkin(self, outcome);
    }
}
