//! Request id allocation and response correlation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::channel::ChannelError;

/// Result delivered to a waiting caller
pub type Delivery = Result<Value, ChannelError>;

/// Monotonic request id source
///
/// Ids start at 1 and are never reused within a process.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Process-wide generator shared by every channel
    pub fn global() -> &'static RequestIdGenerator {
        static GLOBAL: RequestIdGenerator = RequestIdGenerator::new();
        &GLOBAL
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate an id from the process-wide generator
pub fn next_request_id() -> u64 {
    RequestIdGenerator::global().next_id()
}

/// Outcome of routing a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Handed to the waiting caller
    Delivered,

    /// No caller was waiting on this id (late, duplicate or fabricated)
    Unknown,

    /// The caller registered but stopped listening before delivery
    Abandoned,
}

/// Table of outstanding requests
///
/// Each registered id is completed at most once. Responses for ids that are
/// not outstanding are counted as correlation anomalies and dropped.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u64, oneshot::Sender<Delivery>>>,
    anomalies: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request and return the receiving half
    ///
    /// Registering an id that is already outstanding replaces the earlier
    /// waiter, which then observes a dropped sender.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(id, tx).is_some() {
            tracing::warn!(request_id = id, "request id registered twice");
        }
        rx
    }

    /// Route a delivery to the caller waiting on `id`
    pub fn complete(&self, id: u64, delivery: Delivery) -> Completion {
        let sender = self.pending.lock().remove(&id);
        match sender {
            Some(tx) => match tx.send(delivery) {
                Ok(()) => Completion::Delivered,
                Err(_) => Completion::Abandoned,
            },
            None => {
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                Completion::Unknown
            }
        }
    }

    /// Forget an outstanding request (timeout or send failure)
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Fail every outstanding request, returning how many were failed
    pub fn fail_all(&self, error: impl Fn() -> ChannelError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Responses received for ids nobody was waiting on
    pub fn anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }
}
