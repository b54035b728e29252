//! Per-worker lifecycle state machine
//!
//! ```text
//!                ┌──────────────┐
//!                │ Initializing │────────────────────────┐
//!                └──────┬───────┘                        │
//!                       ▼                                ▼
//!  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐   ┌────────────┐
//!  │ Degraded │◄─►│  Ready   │◄─►│   Busy   │──►│ Terminating │──►│ Terminated │
//!  └────┬─────┘   └──────────┘   └────┬─────┘   └─────────────┘   └────────────┘
//!       ▲                             │                ▲
//!       └─────────────────────────────┘                │
//!       └──────────────────────────────────────────────┘
//! ```
//!
//! The machine is purely local bookkeeping: it never performs I/O.
//! Transitions outside the adjacency table fail and leave it untouched.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::duration_millis;

/// Transition history entries kept per worker
pub const MAX_HISTORY: usize = 100;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Initializing,
    Ready,
    Busy,
    Degraded,
    Terminating,
    Terminated,
}

impl WorkerState {
    /// States reachable in one step
    pub fn valid_targets(&self) -> &'static [WorkerState] {
        use WorkerState::*;
        match self {
            Initializing => &[Ready, Terminating],
            Ready => &[Busy, Degraded, Terminating],
            Busy => &[Ready, Degraded, Terminating],
            Degraded => &[Ready, Terminating],
            Terminating => &[Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        self.valid_targets().contains(&target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Degraded => "degraded",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known health of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for worker {worker_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub worker_id: String,
    pub from: WorkerState,
    pub to: WorkerState,
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkerState,
    pub to: WorkerState,
    pub reason: String,

    /// Time spent in `from` before this transition
    #[serde(with = "duration_millis")]
    pub duration_in_prior_state: Duration,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    pub at: DateTime<Utc>,
}

/// Lifecycle and health of a single worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStateMachine {
    worker_id: String,
    state: WorkerState,
    health: WorkerHealth,
    entered_state_at: Instant,
    history: VecDeque<TransitionRecord>,
}

impl WorkerStateMachine {
    /// New machine in `initializing` with `unknown` health
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            state: WorkerState::Initializing,
            health: WorkerHealth::Unknown,
            entered_state_at: Instant::now(),
            history: VecDeque::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn health(&self) -> WorkerHealth {
        self.health
    }

    pub fn entered_state_at(&self) -> Instant {
        self.entered_state_at
    }

    pub fn time_in_state(&self) -> Duration {
        self.entered_state_at.elapsed()
    }

    /// Oldest first, at most [`MAX_HISTORY`] entries
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Move to `target`, recording why
    pub fn transition(
        &mut self,
        target: WorkerState,
        reason: impl Into<String>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<TransitionRecord, InvalidTransition> {
        if !self.state.can_transition_to(target) {
            return Err(InvalidTransition {
                worker_id: self.worker_id.clone(),
                from: self.state,
                to: target,
            });
        }

        let now = Instant::now();
        let record = TransitionRecord {
            from: self.state,
            to: target,
            reason: reason.into(),
            duration_in_prior_state: now.saturating_duration_since(self.entered_state_at),
            metadata,
            at: Utc::now(),
        };

        self.state = target;
        self.entered_state_at = now;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        Ok(record)
    }

    /// Ready and known healthy
    pub fn can_accept_work(&self) -> bool {
        self.state == WorkerState::Ready && self.health == WorkerHealth::Healthy
    }

    pub fn should_remove(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Terminating | WorkerState::Terminated
        )
    }

    /// Record a health observation, returning the previous value
    pub fn update_health(&mut self, health: WorkerHealth) -> WorkerHealth {
        std::mem::replace(&mut self.health, health)
    }
}
