// Pool Events and Observers
//
// Structured events for worker lifecycle, health checks, circuit breakers and
// retries, delivered to pluggable observers. Observers are the only side
// channel of the pool: core logic calls them and moves on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::migration::MigrationStatus;
use crate::recovery::RecoveryAction;
use crate::state_machine::WorkerState;

// ============================================================================
// PoolEvent
// ============================================================================

/// Outcome of a call through a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    Rejected,
}

/// Event emitted by the pool and its reliability components
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerCreated {
        worker_id: String,
        overflow: bool,
        duration_ms: u64,
    },
    WorkerSpawnFailed {
        worker_id: String,
        error: String,
    },
    WorkerRemoved {
        worker_id: String,
        reason: String,
    },
    WorkerTerminated {
        worker_id: String,
        graceful: bool,
    },
    StateTransition {
        worker_id: String,
        from: WorkerState,
        to: WorkerState,
        reason: String,
    },
    HealthCheck {
        worker_id: String,
        healthy: bool,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RecoveryDecided {
        worker_id: String,
        action: RecoveryAction,
        delay_ms: u64,
        reason: String,
    },
    CircuitStateChanged {
        circuit: String,
        from: CircuitState,
        to: CircuitState,
    },
    CircuitCall {
        circuit: String,
        outcome: CallOutcome,
        duration_ms: u64,
    },
    RetrySucceeded {
        attempts: u32,
        duration_ms: u64,
    },
    RetryExhausted {
        attempts: u32,
        error: String,
    },
    CorrelationAnomaly {
        worker_id: String,
        total: u64,
    },
    ReplacementRequested {
        worker_id: String,
        reason: String,
    },
    SessionMigrated {
        migration_id: Uuid,
        session_id: String,
        from_worker: String,
        to_worker: String,
        status: MigrationStatus,
    },
}

impl PoolEvent {
    /// Dotted event type used for observer filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkerCreated { .. } => "worker.created",
            Self::WorkerSpawnFailed { .. } => "worker.spawn_failed",
            Self::WorkerRemoved { .. } => "worker.removed",
            Self::WorkerTerminated { .. } => "worker.terminated",
            Self::StateTransition { .. } => "worker.transition",
            Self::HealthCheck { .. } => "worker.health_check",
            Self::RecoveryDecided { .. } => "worker.recovery",
            Self::CircuitStateChanged { .. } => "circuit.state_changed",
            Self::CircuitCall { .. } => "circuit.call",
            Self::RetrySucceeded { .. } => "retry.succeeded",
            Self::RetryExhausted { .. } => "retry.exhausted",
            Self::CorrelationAnomaly { .. } => "protocol.correlation_anomaly",
            Self::ReplacementRequested { .. } => "pool.replacement_requested",
            Self::SessionMigrated { .. } => "session.migrated",
        }
    }
}

// ============================================================================
// EventObserver Trait
// ============================================================================

/// Receives pool events
///
/// Observers are called synchronously on the emitting task and should be
/// fast. A panicking observer is caught and logged; it never affects the
/// operation that emitted the event.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &PoolEvent);

    /// Event types this observer wants; `None` means all
    fn event_types(&self) -> Option<Vec<&'static str>> {
        None
    }

    fn name(&self) -> &'static str {
        "EventObserver"
    }
}

/// Deliver an event to one observer, honoring its filter and isolating panics
pub fn emit(observer: &dyn EventObserver, event: &PoolEvent) {
    if let Some(types) = observer.event_types() {
        if !types.contains(&event.event_type()) {
            return;
        }
    }
    if catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
        tracing::warn!(
            observer = observer.name(),
            event_type = event.event_type(),
            "event observer panicked"
        );
    }
}

// ============================================================================
// NoopEventObserver
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NoopEventObserver;

impl EventObserver for NoopEventObserver {
    fn on_event(&self, _event: &PoolEvent) {}

    fn name(&self) -> &'static str {
        "NoopEventObserver"
    }
}

// ============================================================================
// TracingEventObserver
// ============================================================================

/// Writes every event to `tracing` under the `pyfleet::events` target
#[derive(Debug, Clone, Default)]
pub struct TracingEventObserver;

impl EventObserver for TracingEventObserver {
    fn on_event(&self, event: &PoolEvent) {
        let event_type = event.event_type();
        match event {
            PoolEvent::WorkerSpawnFailed { worker_id, error } => {
                tracing::warn!(target: "pyfleet::events", event_type, worker_id, error, "worker failed to start")
            }
            PoolEvent::WorkerRemoved { worker_id, reason } => {
                tracing::info!(target: "pyfleet::events", event_type, worker_id, reason, "worker removed")
            }
            PoolEvent::CircuitStateChanged { circuit, from, to } => {
                tracing::warn!(target: "pyfleet::events", event_type, circuit, %from, %to, "circuit state changed")
            }
            PoolEvent::RetryExhausted { attempts, error } => {
                tracing::warn!(target: "pyfleet::events", event_type, attempts, error, "retries exhausted")
            }
            PoolEvent::CorrelationAnomaly { worker_id, total } => {
                tracing::warn!(target: "pyfleet::events", event_type, worker_id, total, "unmatched worker responses")
            }
            PoolEvent::HealthCheck {
                worker_id,
                healthy: false,
                error,
                ..
            } => {
                tracing::warn!(target: "pyfleet::events", event_type, worker_id, error = ?error, "health check failed")
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_default();
                tracing::debug!(target: "pyfleet::events", event_type, %payload, "pool event")
            }
        }
    }

    fn name(&self) -> &'static str {
        "TracingEventObserver"
    }
}

// ============================================================================
// CompositeEventObserver
// ============================================================================

/// Forwards events to several observers, each with its own filter
#[derive(Default)]
pub struct CompositeEventObserver {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl CompositeEventObserver {
    pub fn new(observers: Vec<Arc<dyn EventObserver>>) -> Self {
        Self { observers }
    }

    pub fn add(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl EventObserver for CompositeEventObserver {
    fn on_event(&self, event: &PoolEvent) {
        for observer in &self.observers {
            emit(observer.as_ref(), event);
        }
    }

    fn name(&self) -> &'static str {
        "CompositeEventObserver"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<&'static str>>,
        filter: Option<Vec<&'static str>>,
    }

    impl EventObserver for Recording {
        fn on_event(&self, event: &PoolEvent) {
            self.seen.lock().push(event.event_type());
        }

        fn event_types(&self) -> Option<Vec<&'static str>> {
            self.filter.clone()
        }
    }

    struct Panicking;

    impl EventObserver for Panicking {
        fn on_event(&self, _event: &PoolEvent) {
            panic!("observer bug");
        }
    }

    fn removed() -> PoolEvent {
        PoolEvent::WorkerRemoved {
            worker_id: "w1".into(),
            reason: "channel exited".into(),
        }
    }

    fn retry_ok() -> PoolEvent {
        PoolEvent::RetrySucceeded {
            attempts: 2,
            duration_ms: 10,
        }
    }

    #[test]
    fn test_noop_observer() {
        let observer = NoopEventObserver;
        assert_eq!(observer.name(), "NoopEventObserver");
        assert!(observer.event_types().is_none());
        emit(&observer, &removed());
    }

    #[test]
    fn test_default_name() {
        let observer = Recording::default();
        assert_eq!(observer.name(), "EventObserver");
    }

    #[test]
    fn test_filter_is_honored() {
        let observer = Recording {
            filter: Some(vec!["retry.succeeded"]),
            ..Default::default()
        };
        emit(&observer, &removed());
        emit(&observer, &retry_ok());
        assert_eq!(*observer.seen.lock(), vec!["retry.succeeded"]);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let recording = Arc::new(Recording::default());
        let composite = CompositeEventObserver::new(vec![
            Arc::new(Panicking),
            recording.clone(),
        ]);
        assert_eq!(composite.len(), 2);

        emit(&composite, &removed());
        assert_eq!(*recording.seen.lock(), vec!["worker.removed"]);
    }

    #[test]
    fn test_composite_applies_child_filters() {
        let all = Arc::new(Recording::default());
        let only_retry = Arc::new(Recording {
            filter: Some(vec!["retry.succeeded"]),
            ..Default::default()
        });
        let mut composite = CompositeEventObserver::default();
        assert!(composite.is_empty());
        composite.add(all.clone());
        composite.add(only_retry.clone());

        composite.on_event(&removed());
        composite.on_event(&retry_ok());

        assert_eq!(all.seen.lock().len(), 2);
        assert_eq!(*only_retry.seen.lock(), vec!["retry.succeeded"]);
    }

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(PoolEvent::StateTransition {
            worker_id: "w1".into(),
            from: WorkerState::Ready,
            to: WorkerState::Busy,
            reason: "checkout".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "state_transition");
        assert_eq!(value["from"], "ready");
        assert_eq!(value["to"], "busy");
    }

    #[test]
    fn test_tracing_observer_handles_every_shape() {
        let observer = TracingEventObserver;
        observer.on_event(&removed());
        observer.on_event(&retry_ok());
        observer.on_event(&PoolEvent::HealthCheck {
            worker_id: "w1".into(),
            healthy: false,
            duration_ms: 3,
            error: Some("timeout".into()),
        });
    }
}
