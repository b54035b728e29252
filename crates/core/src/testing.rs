// Test Support
//
// In-memory workers that speak the real framed protocol over duplex pipes,
// and an observer that records events. Used by unit tests, integration
// tests and the CLI's `--in-memory` mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pyfleet_protocol::{
    decode_request, encode_response_payload, ChannelConfig, Response, WorkerChannel, WorkerError,
};
use serde_json::{json, Value};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::PoolError;
use crate::events::{EventObserver, PoolEvent};
use crate::worker::{SpawnedWorker, WorkerProcess, WorkerSpawner};

const PIPE_CAPACITY: usize = 64 * 1024;

// ============================================================================
// CollectingObserver
// ============================================================================

/// Records every event it sees
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<PoolEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given dotted type
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventObserver for CollectingObserver {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }

    fn name(&self) -> &'static str {
        "CollectingObserver"
    }
}

// ============================================================================
// Scripted worker
// ============================================================================

/// What a scripted worker has seen and how it should behave
#[derive(Debug, Default)]
struct WorkerLog {
    commands: Mutex<Vec<String>>,
    unhealthy: AtomicBool,
    killed: AtomicBool,
    ping_delay: Duration,
}

struct ScriptedHandle {
    task: Option<JoinHandle<()>>,
    log: Arc<WorkerLog>,
}

/// Spawns in-process workers that answer a small command set:
///
/// | command    | behavior                                            |
/// |------------|-----------------------------------------------------|
/// | `ping`     | `{"status": "ok"}`, or an error while unhealthy     |
/// |            | (after the configured ping delay)                   |
/// | `echo`     | returns its args                                    |
/// | `whoami`   | `{"worker_id": ...}`                                |
/// | `sleep`    | waits `ms` milliseconds, then answers               |
/// | `fail`     | error reply with `message`                          |
/// | `stray`    | sends a response with an unknown id, then answers   |
/// | `garbage`  | sends a non-UTF-8 frame                             |
/// | `crash`    | exits without answering                             |
/// | `shutdown` | answers, then exits                                 |
///
/// Requests are handled one at a time, like a single-threaded worker.
#[derive(Default)]
pub struct InMemorySpawner {
    spawned: AtomicU64,
    fail_next: AtomicU32,
    startup_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    workers: Mutex<HashMap<String, ScriptedHandle>>,
}

impl InMemorySpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_startup_delay(self, delay: Duration) -> Self {
        *self.startup_delay.lock() = delay;
        self
    }

    /// Delay every `ping` answer by `delay`
    pub fn with_ping_delay(self, delay: Duration) -> Self {
        *self.ping_delay.lock() = delay;
        self
    }

    /// Make the next `count` spawns fail with `worker_init_failed`
    pub fn fail_next_spawns(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Successful spawns so far
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Kill a worker's task as if the process died; false if unknown
    pub async fn crash(&self, worker_id: &str) -> bool {
        let task = self
            .workers
            .lock()
            .get_mut(worker_id)
            .and_then(|handle| handle.task.take());
        match task {
            Some(task) => {
                task.abort();
                let _ = task.await;
                true
            }
            None => false,
        }
    }

    /// Make `ping` fail (or succeed again) on one worker
    pub fn set_healthy(&self, worker_id: &str, healthy: bool) {
        if let Some(handle) = self.workers.lock().get(worker_id) {
            handle.log.unhealthy.store(!healthy, Ordering::SeqCst);
        }
    }

    /// Commands a worker has received, oldest first
    pub fn commands(&self, worker_id: &str) -> Vec<String> {
        self.workers
            .lock()
            .get(worker_id)
            .map(|handle| handle.log.commands.lock().clone())
            .unwrap_or_default()
    }

    pub fn was_killed(&self, worker_id: &str) -> bool {
        self.workers
            .lock()
            .get(worker_id)
            .is_some_and(|handle| handle.log.killed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl WorkerSpawner for InMemorySpawner {
    async fn spawn(&self, worker_id: &str) -> Result<SpawnedWorker, PoolError> {
        let delay = *self.startup_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(
                PoolError::worker_init_failed("scripted spawn failure").with_worker(worker_id)
            );
        }

        let (pool_out, worker_in) = duplex(PIPE_CAPACITY);
        let (worker_out, pool_in) = duplex(PIPE_CAPACITY);
        let log = Arc::new(WorkerLog {
            ping_delay: *self.ping_delay.lock(),
            ..WorkerLog::default()
        });
        let (exited_tx, exited_rx) = watch::channel(false);

        let task = tokio::spawn(run_script(
            worker_id.to_string(),
            FramedRead::new(worker_in, LengthDelimitedCodec::new()),
            FramedWrite::new(worker_out, LengthDelimitedCodec::new()),
            Arc::clone(&log),
            exited_tx,
        ));
        let pid = 10_000 + self.spawned.fetch_add(1, Ordering::SeqCst) as u32;
        let process = ScriptedProcess {
            pid,
            exited: exited_rx,
            abort: task.abort_handle(),
            log: Arc::clone(&log),
        };
        self.workers.lock().insert(
            worker_id.to_string(),
            ScriptedHandle {
                task: Some(task),
                log,
            },
        );

        Ok(SpawnedWorker {
            channel: WorkerChannel::new(pool_in, pool_out, ChannelConfig::new(worker_id)),
            process: Box::new(process),
        })
    }

    fn name(&self) -> &'static str {
        "InMemorySpawner"
    }
}

struct ScriptedProcess {
    pid: u32,
    exited: watch::Receiver<bool>,
    abort: AbortHandle,
    log: Arc<WorkerLog>,
}

#[async_trait]
impl WorkerProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut exited = self.exited.clone();
        // A dropped sender means the task is gone, which counts as exited
        let exited_in_time = tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        exited_in_time
    }

    async fn kill(&self) {
        self.log.killed.store(true, Ordering::SeqCst);
        self.abort.abort();
    }
}

type ScriptReader = FramedRead<DuplexStream, LengthDelimitedCodec>;
type ScriptWriter = FramedWrite<DuplexStream, LengthDelimitedCodec>;

async fn run_script(
    worker_id: String,
    mut reader: ScriptReader,
    mut writer: ScriptWriter,
    log: Arc<WorkerLog>,
    exited: watch::Sender<bool>,
) {
    let mut stray_ids = u64::MAX;

    while let Some(Ok(frame)) = reader.next().await {
        let Ok(request) = decode_request(&frame) else {
            continue;
        };
        log.commands.lock().push(request.command.clone());
        let args = request.args;

        let reply: Result<Value, WorkerError> = match request.command.as_str() {
            "ping" => {
                if !log.ping_delay.is_zero() {
                    tokio::time::sleep(log.ping_delay).await;
                }
                if log.unhealthy.load(Ordering::SeqCst) {
                    Err(WorkerError::new("worker unhealthy").with_type("HealthError"))
                } else {
                    Ok(json!({"status": "ok", "worker_id": worker_id}))
                }
            }
            "echo" => Ok(Value::Object(args)),
            "whoami" => Ok(json!({"worker_id": worker_id})),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"slept_ms": ms}))
            }
            "fail" => {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("command failed");
                Err(WorkerError::new(message).with_type("ValueError"))
            }
            "stray" => {
                stray_ids -= 1;
                let unknown = Response::ok(stray_ids, Value::Null);
                if let Ok(payload) = encode_response_payload(&unknown) {
                    let _ = writer.send(payload).await;
                }
                Ok(json!({"stray": true}))
            }
            "garbage" => {
                let _ = writer.send(Bytes::from_static(&[0xff, 0xfe, 0x00])).await;
                continue;
            }
            "crash" => break,
            "shutdown" => {
                if let Ok(payload) =
                    encode_response_payload(&Response::ok(request.id, json!({"status": "shutting_down"})))
                {
                    let _ = writer.send(payload).await;
                }
                break;
            }
            other => Err(WorkerError::new(format!("Unknown command: {other}")).with_type("UnknownCommand")),
        };

        let response = match reply {
            Ok(result) => Response::ok(request.id, result),
            Err(error) => Response::error(request.id, error),
        };
        let Ok(payload) = encode_response_payload(&response) else {
            continue;
        };
        if writer.send(payload).await.is_err() {
            break;
        }
    }

    let _ = exited.send(true);
}
