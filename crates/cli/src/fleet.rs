// Pool setup for a single CLI invocation

use std::sync::Arc;

use anyhow::{Context, Result};
use pyfleet_core::testing::InMemorySpawner;
use pyfleet_core::{
    CircuitBreakerRegistry, FleetConfig, Pool, PythonSpawner, ReplacementSupervisor, RetryPolicy,
    TracingEventObserver, WorkerSpawner,
};
use tokio::task::JoinHandle;

use crate::Cli;

pub struct Fleet {
    pub pool: Pool,
    pub retry: RetryPolicy,
    supervisor: Option<JoinHandle<()>>,
}

impl Fleet {
    pub async fn start(cli: &Cli) -> Result<Self> {
        let config = resolve_config(cli)?;

        let spawner: Arc<dyn WorkerSpawner> = if cli.in_memory {
            Arc::new(InMemorySpawner::new())
        } else {
            Arc::new(PythonSpawner::new(config.python.clone()))
        };
        let observer = Arc::new(TracingEventObserver);
        let circuits = Arc::new(
            CircuitBreakerRegistry::new(config.circuit.clone()).with_observer(observer.clone()),
        );

        let pool = Pool::builder(spawner)
            .with_config(config.pool.clone())
            .with_recovery(config.recovery.clone())
            .with_observer(observer)
            .with_circuits(circuits)
            .start()
            .await?;
        let supervisor = ReplacementSupervisor::new(pool.clone()).spawn();

        tracing::debug!(
            workers = pool.status().workers,
            in_memory = cli.in_memory,
            "fleet ready"
        );
        Ok(Self {
            pool,
            retry: config.retry,
            supervisor,
        })
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        if let Some(supervisor) = self.supervisor {
            let _ = supervisor.await;
        }
    }
}

/// Environment first, then command-line flags
fn resolve_config(cli: &Cli) -> Result<FleetConfig> {
    let mut config = FleetConfig::from_env().context("invalid PYFLEET_* environment")?;
    if let Some(script) = &cli.script {
        config.python.script = script.clone();
    }
    if let Some(python) = &cli.python {
        config.python.python = python.clone();
    }
    if let Some(size) = cli.size {
        config.pool.size = size;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}
