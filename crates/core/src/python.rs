//! Python worker processes
//!
//! Launches `<python> <script> --mode pool-worker --worker-id <id>` with
//! stdin/stdout piped into a [`WorkerChannel`] and stderr forwarded to
//! `tracing`. A worker counts as started only after it answers the readiness
//! command within `startup_timeout`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pyfleet_protocol::{ChannelConfig, WorkerChannel, MAX_FRAME_LENGTH};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::duration_millis;
use crate::error::PoolError;
use crate::worker::{SpawnedWorker, WorkerProcess, WorkerSpawner};

/// How to launch a Python worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonWorkerConfig {
    /// Interpreter executable
    pub python: String,

    /// Bridge script passed as the first argument
    pub script: PathBuf,

    /// Appended after `--worker-id <id>`
    #[serde(default)]
    pub extra_args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// Command a fresh worker must answer before it is usable
    pub readiness_command: String,

    pub max_frame_length: usize,
}

impl Default for PythonWorkerConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            script: PathBuf::from("worker.py"),
            extra_args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            startup_timeout: Duration::from_secs(10),
            readiness_command: "ping".to_string(),
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl PythonWorkerConfig {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Full argument list after the interpreter
    pub fn args_for(&self, worker_id: &str) -> Vec<String> {
        let mut args = vec![
            self.script.to_string_lossy().into_owned(),
            "--mode".to_string(),
            "pool-worker".to_string(),
            "--worker-id".to_string(),
            worker_id.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Spawns real Python worker processes
#[derive(Debug, Clone)]
pub struct PythonSpawner {
    config: PythonWorkerConfig,
}

impl PythonSpawner {
    pub fn new(config: PythonWorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PythonWorkerConfig {
        &self.config
    }
}

#[async_trait]
impl WorkerSpawner for PythonSpawner {
    async fn spawn(&self, worker_id: &str) -> Result<SpawnedWorker, PoolError> {
        let config = &self.config;
        let mut command = Command::new(&config.python);
        command
            .args(config.args_for(worker_id))
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            PoolError::worker_init_failed(format!("failed to launch {}: {e}", config.python))
                .with_worker(worker_id)
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(PoolError::worker_init_failed("worker stdio was not piped").with_worker(worker_id));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(worker_id.to_string(), stderr));
        }

        let channel = WorkerChannel::new(
            stdout,
            stdin,
            ChannelConfig::new(worker_id).with_max_frame_length(config.max_frame_length),
        );

        if let Err(e) = channel
            .call(&config.readiness_command, &json!({}), config.startup_timeout)
            .await
        {
            warn!(worker_id, error = %e, "worker failed readiness check");
            channel.close("readiness check failed").await;
            let _ = child.kill().await;
            return Err(PoolError::worker_init_failed(format!(
                "worker did not answer {} within {:?}: {e}",
                config.readiness_command, config.startup_timeout
            ))
            .with_worker(worker_id));
        }

        info!(worker_id, pid = ?pid, "python worker started");
        Ok(SpawnedWorker {
            channel,
            process: Box::new(ChildProcess {
                pid,
                child: Mutex::new(child),
            }),
        })
    }

    fn name(&self) -> &'static str {
        "PythonSpawner"
    }
}

async fn forward_stderr(worker_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "pyfleet::worker_stderr", worker_id = %worker_id, "{line}");
    }
}

struct ChildProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, %status, "worker process exited");
                true
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "failed to wait for worker process");
                false
            }
            Err(_) => false,
        }
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(pid = ?self.pid, error = %e, "worker process already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_for_worker() {
        let config = PythonWorkerConfig::new("bridge.py")
            .with_extra_args(vec!["--verbose".to_string()]);
        assert_eq!(
            config.args_for("pool-1"),
            vec!["bridge.py", "--mode", "pool-worker", "--worker-id", "pool-1", "--verbose"]
        );
    }

    #[test]
    fn test_defaults() {
        let config = PythonWorkerConfig::default();
        assert_eq!(config.python, "python3");
        assert_eq!(config.readiness_command, "ping");
        assert_eq!(config.startup_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_init_failure() {
        let spawner = PythonSpawner::new(
            PythonWorkerConfig::new("bridge.py").with_python("/nonexistent/python-for-tests"),
        );
        let error = spawner.spawn("w1").await.err().unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::WorkerInitFailed);
        assert_eq!(error.context.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_silent_process_fails_readiness() {
        // `sleep` never answers the readiness ping
        let spawner = PythonSpawner::new(PythonWorkerConfig {
            python: "sleep".to_string(),
            script: PathBuf::from("30"),
            startup_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let error = spawner.spawn("w1").await.err().unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::WorkerInitFailed);
    }
}
