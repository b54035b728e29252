// pyfleet Core
//
// Pool manager for external Python worker processes.
//
// Key design decisions:
// - Workers are reached only through the framed protocol in pyfleet-protocol
// - Process creation sits behind the WorkerSpawner trait (PythonSpawner for
//   real interpreters, InMemorySpawner for tests and demos)
// - The pool decides; a separate ReplacementSupervisor acts on replacement signals
// - Session affinity is a hint: a dead or busy preferred worker never blocks a call
// - Failures are classified once (PoolError) and every policy reads that classification
// - Lifecycle changes are reported to a synchronous EventObserver

// Building blocks
pub mod affinity;
pub mod circuit_breaker;
pub mod duration_millis;
pub mod error;
pub mod events;
pub mod migration;
pub mod recovery;
pub mod retry;
pub mod state_machine;

// Workers and the pool
pub mod pool;
pub mod python;
pub mod worker;

// Call-site helpers
pub mod client;
pub mod supervisor;

// Ambient
pub mod config;
pub mod telemetry;

// In-memory workers for tests and demos
pub mod testing;

pub use affinity::{AffinityMiss, SessionAffinity};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitRejection,
    CircuitSnapshot, CircuitState,
};
pub use client::FleetClient;
pub use config::{ConfigError, FleetConfig};
pub use error::{ErrorCategory, ErrorContext, ErrorKind, PoolError};
pub use events::{
    CallOutcome, CompositeEventObserver, EventObserver, NoopEventObserver, PoolEvent,
    TracingEventObserver,
};
pub use migration::{MigrationError, MigrationRecord, MigrationStatus, MigrationTracker};
pub use pool::{
    CheckinOutcome, CheckoutMode, HealthReport, Pool, PoolBuilder, PoolConfig, PoolStatus,
    ReplacementRequest, WorkerLease,
};
pub use python::{PythonSpawner, PythonWorkerConfig};
pub use recovery::{
    FailureReason, RecoveryAction, RecoveryConfig, RecoveryContext, RecoveryPolicy,
    RecoveryStrategy,
};
pub use retry::{BackoffStrategy, RetryExecutor, RetryPolicy};
pub use state_machine::{WorkerHealth, WorkerState, WorkerStateMachine};
pub use supervisor::ReplacementSupervisor;
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig};
pub use worker::{SpawnedWorker, WorkerInfo, WorkerProcess, WorkerSpawner, WorkerStats};
