//! Error taxonomy
//!
//! Every failure a caller can observe is a [`PoolError`]: a closed
//! [`ErrorKind`], its derived [`ErrorCategory`], a message, and an
//! [`ErrorContext`]. Errors are created once, where the failure is first
//! observed; outer layers annotate the context rather than wrapping again.

use std::collections::BTreeMap;
use std::time::Duration;

use pyfleet_protocol::ChannelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broad error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TimeoutError,
    ResourceError,
    CommunicationError,
    SystemError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeoutError => write!(f, "timeout_error"),
            Self::ResourceError => write!(f, "resource_error"),
            Self::CommunicationError => write!(f, "communication_error"),
            Self::SystemError => write!(f, "system_error"),
        }
    }
}

/// Specific error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No worker became available within the checkout timeout
    CheckoutTimeout,
    /// The worker did not answer within the operation timeout
    OperationTimeout,
    /// The pool has no live worker and cannot create one, or is shutting down
    PoolUnavailable,
    /// A worker process could not be started or never became ready
    WorkerInitFailed,
    /// Rejected by an open circuit
    CircuitOpen,
    /// Rejected because the half-open probe slots are taken
    HalfOpenLimit,
    /// The worker's channel is gone (process exited, pipe closed)
    ChannelClosed,
    /// The worker sent a frame that could not be decoded
    ProtocolDecodeError,
    /// The caller's reply was lost to a correlation fault; stray responses
    /// that match no caller are only counted
    ResponseMismatch,
    /// The worker answered with an error for this command
    CommandFailed,
    UnexpectedError,
    SupervisorFailure,
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CheckoutTimeout | Self::OperationTimeout => ErrorCategory::TimeoutError,
            Self::PoolUnavailable
            | Self::WorkerInitFailed
            | Self::CircuitOpen
            | Self::HalfOpenLimit => ErrorCategory::ResourceError,
            Self::ChannelClosed | Self::ProtocolDecodeError | Self::ResponseMismatch => {
                ErrorCategory::CommunicationError
            }
            Self::CommandFailed | Self::UnexpectedError | Self::SupervisorFailure => {
                ErrorCategory::SystemError
            }
        }
    }

    /// Retryability when no explicit override is set
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::CheckoutTimeout | Self::OperationTimeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckoutTimeout => "checkout_timeout",
            Self::OperationTimeout => "operation_timeout",
            Self::PoolUnavailable => "pool_unavailable",
            Self::WorkerInitFailed => "worker_init_failed",
            Self::CircuitOpen => "circuit_open",
            Self::HalfOpenLimit => "half_open_limit",
            Self::ChannelClosed => "channel_closed",
            Self::ProtocolDecodeError => "protocol_decode_error",
            Self::ResponseMismatch => "response_mismatch",
            Self::CommandFailed => "command_failed",
            Self::UnexpectedError => "unexpected_error",
            Self::SupervisorFailure => "supervisor_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an error happened
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// 1-based attempt number, set by the retry executor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Structured error returned to pool callers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PoolError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    retryable: Option<bool>,
}

impl PoolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            retryable: None,
        }
    }

    pub fn checkout_timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorKind::CheckoutTimeout,
            format!("no worker became available within {timeout:?}"),
        )
    }

    pub fn operation_timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorKind::OperationTimeout,
            format!("worker did not respond within {timeout:?}"),
        )
    }

    pub fn pool_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PoolUnavailable, message)
    }

    pub fn worker_init_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerInitFailed, message)
    }

    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelClosed, reason)
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandFailed, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnexpectedError, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
            .unwrap_or_else(|| self.kind.default_retryable())
    }

    /// Rejections raised by a circuit breaker
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self.kind, ErrorKind::CircuitOpen | ErrorKind::HalfOpenLimit)
    }

    /// Whether the failure says something about the worker's health
    ///
    /// A worker that answered with an error reply did its job; the caller's
    /// command failed, not the worker.
    pub fn implicates_worker(&self) -> bool {
        !matches!(self.kind, ErrorKind::CommandFailed)
    }

    /// Override the kind's default retryability
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.context.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.context.session_id = Some(session_id.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.context.command = Some(command.into());
        self
    }

    /// Record the attempt number, replacing any earlier annotation
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.context.attempt = Some(attempt);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.metadata.insert(key.into(), value.into());
        self
    }

    /// JSON shape used by the CLI and diagnostics
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "category": self.category(),
            "kind": self.kind,
            "message": self.message,
            "retryable": self.is_retryable(),
            "context": self.context,
        })
    }
}

impl From<ChannelError> for PoolError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Closed { reason } => Self::channel_closed(reason),
            ChannelError::Timeout {
                request_id,
                timeout,
            } => Self::operation_timeout(timeout).with_metadata("request_id", request_id),
            ChannelError::Decode(e) => Self::new(ErrorKind::ProtocolDecodeError, e.to_string()),
            ChannelError::Mismatch { request_id } => {
                Self::new(ErrorKind::ResponseMismatch, format!("no response matched request {request_id}"))
                    .with_metadata("request_id", request_id)
            }
            // Unencodable arguments are the caller's problem, not the worker's
            ChannelError::Encode(e) => {
                Self::command_failed(format!("request could not be encoded: {e}"))
            }
            ChannelError::Remote(remote) => {
                let mut error = Self::command_failed(remote.message);
                if let Some(error_type) = remote.error_type {
                    error = error.with_metadata("error_type", error_type);
                }
                if let Some(details) = remote.details {
                    error = error.with_metadata("details", details);
                }
                error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyfleet_protocol::{DecodeError, WorkerError};

    #[test]
    fn test_kind_categories() {
        assert_eq!(
            ErrorKind::CheckoutTimeout.category(),
            ErrorCategory::TimeoutError
        );
        assert_eq!(
            ErrorKind::WorkerInitFailed.category(),
            ErrorCategory::ResourceError
        );
        assert_eq!(
            ErrorKind::ChannelClosed.category(),
            ErrorCategory::CommunicationError
        );
        assert_eq!(
            ErrorKind::SupervisorFailure.category(),
            ErrorCategory::SystemError
        );
    }

    #[test]
    fn test_default_retryability() {
        assert!(PoolError::checkout_timeout(Duration::from_secs(1)).is_retryable());
        assert!(PoolError::operation_timeout(Duration::from_secs(1)).is_retryable());
        assert!(!PoolError::channel_closed("gone").is_retryable());
        assert!(!PoolError::worker_init_failed("no python").is_retryable());
        assert!(!PoolError::new(ErrorKind::CircuitOpen, "open").is_retryable());
    }

    #[test]
    fn test_retryable_override() {
        let error = PoolError::operation_timeout(Duration::from_secs(1)).with_retryable(false);
        assert!(!error.is_retryable());
        assert_eq!(error.kind, ErrorKind::OperationTimeout);
    }

    #[test]
    fn test_annotation_replaces_attempt() {
        let error = PoolError::channel_closed("eof")
            .with_worker("w1")
            .with_attempt(1)
            .with_attempt(3);
        assert_eq!(error.context.attempt, Some(3));
        assert_eq!(error.context.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn test_display() {
        let error = PoolError::channel_closed("worker closed its output");
        assert_eq!(error.to_string(), "channel_closed: worker closed its output");
    }

    #[test]
    fn test_mismatch_is_a_communication_error() {
        let error: PoolError = ChannelError::Mismatch { request_id: 4 }.into();
        assert_eq!(error.kind, ErrorKind::ResponseMismatch);
        assert_eq!(error.category(), ErrorCategory::CommunicationError);
        assert!(error.implicates_worker());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_from_channel_error() {
        let timeout: PoolError = ChannelError::Timeout {
            request_id: 9,
            timeout: Duration::from_millis(50),
        }
        .into();
        assert_eq!(timeout.kind, ErrorKind::OperationTimeout);
        assert_eq!(timeout.context.metadata["request_id"], 9);

        let decode: PoolError = ChannelError::Decode(DecodeError::WrongEncoding {
            reason: "binary".into(),
        })
        .into();
        assert_eq!(decode.kind, ErrorKind::ProtocolDecodeError);
        assert_eq!(decode.category(), ErrorCategory::CommunicationError);

        let remote: PoolError =
            ChannelError::Remote(WorkerError::new("bad args").with_type("TypeError")).into();
        assert_eq!(remote.kind, ErrorKind::CommandFailed);
        assert!(!remote.implicates_worker());
        assert_eq!(remote.context.metadata["error_type"], "TypeError");
    }

    #[test]
    fn test_to_value_shape() {
        let value = PoolError::checkout_timeout(Duration::from_secs(5))
            .with_session("s1")
            .to_value();
        assert_eq!(value["category"], "timeout_error");
        assert_eq!(value["kind"], "checkout_timeout");
        assert_eq!(value["retryable"], true);
        assert_eq!(value["context"]["session_id"], "s1");
    }
}
