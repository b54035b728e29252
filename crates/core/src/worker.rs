//! Worker processes and their bookkeeping
//!
//! A worker is an external process plus the [`WorkerChannel`] wired to its
//! stdio. [`WorkerSpawner`] creates them; [`WorkerProcess`] is the handle
//! the pool uses to wait for or kill the process during termination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pyfleet_protocol::{ChannelStats, WorkerChannel};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::PoolError;
use crate::state_machine::{TransitionRecord, WorkerHealth, WorkerState, WorkerStateMachine};

/// Handle on a running worker process
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Wait up to `grace` for the process to exit; true if it did
    async fn wait_exit(&self, grace: Duration) -> bool;

    /// Kill the process and reap it
    async fn kill(&self);
}

/// A started worker, ready to be handed to the pool
pub struct SpawnedWorker {
    pub channel: WorkerChannel,
    pub process: Box<dyn WorkerProcess>,
}

/// Starts worker processes
///
/// Implementations return only once the worker can serve requests; a worker
/// that fails to come up is reported as `worker_init_failed`.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, worker_id: &str) -> Result<SpawnedWorker, PoolError>;

    fn name(&self) -> &'static str {
        "WorkerSpawner"
    }
}

/// Per-worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub checkouts: u64,
    pub successful_checkins: u64,
    pub error_checkins: u64,
    pub timeouts: u64,
    pub health_checks: u64,
    pub health_failures: u64,
}

/// Diagnostic view of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub state: WorkerState,
    pub health: WorkerHealth,
    pub pid: Option<u32>,
    pub overflow: bool,
    pub created_at: DateTime<Utc>,
    pub time_in_state_ms: u64,
    pub consecutive_failures: u32,
    pub stats: WorkerStats,
    pub channel: ChannelStats,
    pub sessions: Vec<String>,
    pub history: Vec<TransitionRecord>,
}

/// A worker owned by the pool registry
pub(crate) struct Worker {
    pub id: String,
    pub machine: WorkerStateMachine,
    pub channel: Arc<WorkerChannel>,
    pub process: Arc<dyn WorkerProcess>,
    pub created_at: DateTime<Utc>,
    pub last_used: Instant,
    pub stats: WorkerStats,
    pub consecutive_failures: u32,
    pub health_failures: u32,
    /// Earliest time a cooling-down worker is probed again
    pub recover_after: Option<Instant>,
    /// A health probe owns the channel; the worker is out of rotation
    pub probing: bool,
    pub overflow: bool,
    /// Correlation anomalies already reported as events
    pub reported_anomalies: u64,
}

impl Worker {
    pub fn new(id: String, spawned: SpawnedWorker, overflow: bool) -> Self {
        Self {
            machine: WorkerStateMachine::new(id.clone()),
            id,
            channel: Arc::new(spawned.channel),
            process: Arc::from(spawned.process),
            created_at: Utc::now(),
            last_used: Instant::now(),
            stats: WorkerStats::default(),
            consecutive_failures: 0,
            health_failures: 0,
            recover_after: None,
            probing: false,
            overflow,
            reported_anomalies: 0,
        }
    }

    /// Ready, healthy and not being probed
    pub fn available(&self) -> bool {
        !self.probing && self.machine.can_accept_work()
    }

    pub fn info(&self, sessions: Vec<String>) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            state: self.machine.state(),
            health: self.machine.health(),
            pid: self.process.pid(),
            overflow: self.overflow,
            created_at: self.created_at,
            time_in_state_ms: self.machine.time_in_state().as_millis() as u64,
            consecutive_failures: self.consecutive_failures,
            stats: self.stats.clone(),
            channel: self.channel.stats(),
            sessions,
            history: self.machine.history().cloned().collect(),
        }
    }
}
