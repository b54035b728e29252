//! Framed request/response channel to one worker
//!
//! A channel owns the write half of the worker's stdio and a background
//! reader task for the read half. Callers write their own request frames
//! and then wait on a oneshot registered with the channel's [`Correlator`];
//! the reader task decodes each incoming frame and routes it by id.
//!
//! When the stream ends or a frame cannot be trusted, the channel closes
//! and every outstanding caller receives [`ChannelError::Closed`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use crate::codec::{self, DecodeError, EncodeError, Remediation, MAX_FRAME_LENGTH};
use crate::correlation::{next_request_id, Completion, Correlator};
use crate::message::WorkerError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors surfaced to a caller of [`WorkerChannel::call`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed: {reason}")]
    Closed { reason: String },

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: u64, timeout: Duration },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("worker error: {0}")]
    Remote(WorkerError),

    /// The reply slot for this request was lost while the channel stayed open
    #[error("response for request {request_id} could not be matched")]
    Mismatch { request_id: u64 },
}

impl ChannelError {
    /// True when the channel itself is gone, as opposed to a single request failing
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Label used in logs, usually the worker id
    pub label: String,

    /// Largest accepted incoming frame
    pub max_frame_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            label: "worker".to_string(),
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl ChannelConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// Counters for one channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub requests_sent: u64,
    pub frames_received: u64,
    pub decode_errors: u64,
    pub correlation_anomalies: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct ChannelState {
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    requests_sent: AtomicU64,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl ChannelState {
    /// Mark the channel closed; returns true for the first caller
    fn close(&self, reason: String) -> bool {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "closed".to_string())
    }
}

/// Framed channel to a single worker process
pub struct WorkerChannel {
    label: String,
    writer: AsyncMutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    correlator: Arc<Correlator>,
    state: Arc<ChannelState>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .field("pending", &self.correlator.pending_count())
            .finish()
    }
}

impl WorkerChannel {
    /// Wrap a worker's output (`reader`) and input (`writer`)
    ///
    /// Spawns the reader task, so this must be called inside a Tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = || {
            LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(config.max_frame_length)
                .new_codec()
        };

        let frames = FramedRead::new(Box::new(reader) as BoxedReader, codec());
        let writer = FramedWrite::new(Box::new(writer) as BoxedWriter, codec());
        let correlator = Arc::new(Correlator::new());
        let state = Arc::new(ChannelState::default());

        let handle = tokio::spawn(read_loop(
            config.label.clone(),
            frames,
            Arc::clone(&correlator),
            Arc::clone(&state),
        ));

        Self {
            label: config.label,
            writer: AsyncMutex::new(writer),
            correlator,
            state,
            reader: Mutex::new(Some(handle)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_closed()
    }

    /// Why the channel closed, if it has
    pub fn close_reason(&self) -> Option<String> {
        if self.is_open() {
            None
        } else {
            Some(self.state.reason())
        }
    }

    /// Send a command and wait for its response
    ///
    /// The timeout covers both writing the frame and waiting for the reply.
    /// A response that arrives after the timeout is counted as a
    /// correlation anomaly by the reader task.
    pub async fn call(
        &self,
        command: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        self.ensure_open()?;

        let request_id = next_request_id();
        let payload = codec::encode_request_payload(request_id, command, args)?;
        let deadline = Instant::now() + timeout;

        let rx = self.correlator.register(request_id);
        // The reader may have failed all pending requests between the check
        // above and registration.
        if let Err(e) = self.ensure_open() {
            self.correlator.cancel(request_id);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, self.send_frame(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.correlator.cancel(request_id);
                return Err(e);
            }
            Err(_) => {
                self.correlator.cancel(request_id);
                return Err(ChannelError::Timeout {
                    request_id,
                    timeout,
                });
            }
        }
        trace!(worker = %self.label, request_id, command, "request sent");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(self.lost_reply(request_id)),
            Err(_) => {
                self.correlator.cancel(request_id);
                debug!(worker = %self.label, request_id, command, ?timeout, "request timed out");
                Err(ChannelError::Timeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Close the channel and fail every outstanding request
    ///
    /// Shuts down the write half so a well-behaved worker sees end of input.
    pub async fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state.close(reason.clone()) {
            debug!(worker = %self.label, %reason, "closing channel");
        }
        // A writer stuck on a full pipe keeps the lock; the process is killed
        // by its owner in that case.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = SinkExt::<Bytes>::close(&mut *writer).await;
        }
        self.correlator.fail_all(|| ChannelError::Closed {
            reason: reason.clone(),
        });
    }

    /// Error for a caller whose reply slot was dropped without a delivery
    fn lost_reply(&self, request_id: u64) -> ChannelError {
        if self.is_open() {
            warn!(worker = %self.label, request_id, "reply slot dropped on an open channel");
            ChannelError::Mismatch { request_id }
        } else {
            ChannelError::Closed {
                reason: self.state.reason(),
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn correlation_anomalies(&self) -> u64 {
        self.correlator.anomalies()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            requests_sent: self.state.requests_sent.load(Ordering::Relaxed),
            frames_received: self.state.frames_received.load(Ordering::Relaxed),
            decode_errors: self.state.decode_errors.load(Ordering::Relaxed),
            correlation_anomalies: self.correlator.anomalies(),
            pending: self.correlator.pending_count(),
        }
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.state.is_closed() {
            Err(ChannelError::Closed {
                reason: self.state.reason(),
            })
        } else {
            Ok(())
        }
    }

    async fn send_frame(&self, payload: Bytes) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(payload).await {
            let reason = format!("write failed: {e}");
            self.state.close(reason.clone());
            return Err(ChannelError::Closed { reason });
        }
        self.state.requests_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop(
    label: String,
    mut frames: FramedRead<BoxedReader, LengthDelimitedCodec>,
    correlator: Arc<Correlator>,
    state: Arc<ChannelState>,
) {
    let reason = loop {
        let frame = match frames.next().await {
            None => break "worker closed its output".to_string(),
            Some(Err(e)) => break format!("frame read failed: {e}"),
            Some(Ok(frame)) => frame,
        };
        state.frames_received.fetch_add(1, Ordering::Relaxed);

        match codec::decode_response(&frame) {
            Ok(response) => {
                let request_id = response.id;
                let delivery = response.outcome.map_err(ChannelError::Remote);
                match correlator.complete(request_id, delivery) {
                    Completion::Delivered => {
                        trace!(worker = %label, request_id, "response delivered")
                    }
                    Completion::Unknown => warn!(
                        worker = %label,
                        request_id,
                        anomalies = correlator.anomalies(),
                        "response did not match any outstanding request"
                    ),
                    Completion::Abandoned => {
                        debug!(worker = %label, request_id, "caller stopped waiting")
                    }
                }
            }
            Err(err) => {
                state.decode_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(request_id) = err.request_id() {
                    correlator.complete(request_id, Err(ChannelError::Decode(err.clone())));
                }
                match err.remediation() {
                    Remediation::Continue => {
                        warn!(worker = %label, error = %err, "discarding undecodable frame")
                    }
                    Remediation::RestartChannel => break format!("undecodable frame: {err}"),
                }
            }
        }
    };

    if state.close(reason.clone()) {
        debug!(worker = %label, %reason, "channel closed by reader");
    }
    let failed = correlator.fail_all(|| ChannelError::Closed {
        reason: reason.clone(),
    });
    if failed > 0 {
        warn!(worker = %label, failed, %reason, "failed outstanding requests");
    }
}
