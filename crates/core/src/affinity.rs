//! Session affinity table
//!
//! Maps a session id to the worker that last served it. Entries expire after
//! a TTL; an expired entry is dropped on lookup and by the periodic sweeper.
//! A miss is never fatal: callers fall back to any eligible worker.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default binding lifetime
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Default sweeper interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Why a lookup found no usable worker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AffinityMiss {
    #[error("affinity for session expired")]
    Expired,

    #[error("session has no affinity")]
    NoAffinity,
}

#[derive(Debug, Clone)]
struct Binding {
    worker_id: String,
    bound_at: Instant,
}

/// Concurrent session → worker hint table
#[derive(Debug)]
pub struct SessionAffinity {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
}

impl Default for SessionAffinity {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionAffinity {
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bind (or rebind) a session, restarting its TTL
    pub fn bind(&self, session_id: &str, worker_id: &str) {
        self.bindings.insert(
            session_id.to_string(),
            Binding {
                worker_id: worker_id.to_string(),
                bound_at: Instant::now(),
            },
        );
    }

    pub fn lookup(&self, session_id: &str) -> Result<String, AffinityMiss> {
        let expired_at = {
            let Some(binding) = self.bindings.get(session_id) else {
                return Err(AffinityMiss::NoAffinity);
            };
            if binding.bound_at.elapsed() < self.ttl {
                return Ok(binding.worker_id.clone());
            }
            binding.bound_at
        };

        // Only drop the entry we judged expired; a concurrent rebind wins
        self.bindings
            .remove_if(session_id, |_, binding| binding.bound_at == expired_at);
        Err(AffinityMiss::Expired)
    }

    pub fn unbind(&self, session_id: &str) -> bool {
        self.bindings.remove(session_id).is_some()
    }

    /// Drop every binding that points at `worker_id`, returning how many
    pub fn remove_all_for_worker(&self, worker_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| binding.worker_id != worker_id);
        before.saturating_sub(self.bindings.len())
    }

    /// Sessions currently bound to `worker_id`
    pub fn sessions_for_worker(&self, worker_id: &str) -> Vec<String> {
        let mut sessions: Vec<_> = self
            .bindings
            .iter()
            .filter(|entry| entry.value().worker_id == worker_id)
            .map(|entry| entry.key().clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Remove entries older than the TTL
    pub fn sweep(&self) -> usize {
        self.sweep_older_than(self.ttl)
    }

    /// Remove entries older than `max_age`
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| binding.bound_at.elapsed() < max_age);
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&self) {
        self.bindings.clear();
    }

    /// Sweep on `interval` until `shutdown` flips to true
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = table.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = table.len(), "swept expired session bindings");
                        }
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
}
