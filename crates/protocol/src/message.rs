//! Request and response messages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request id, unique for the lifetime of the pool process
    pub id: u64,

    /// Command name understood by the worker (e.g. `ping`, `execute_program`)
    pub command: String,

    /// Command arguments
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Request {
    /// Create a request with empty arguments
    pub fn new(id: u64, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            args: Map::new(),
        }
    }

    /// Set the request arguments
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }
}

/// Error reported by a worker for a single request
///
/// Workers may send either a bare string or an object with
/// `type`, `message` and `details`. Both decode into this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WorkerError {
    /// Python-side error type, when the worker reports one
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Human-readable message
    pub message: String,

    /// Extra structured information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_type: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A decoded worker response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this answers
    pub id: u64,

    /// Result payload on success, worker error otherwise
    pub outcome: Result<Value, WorkerError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: u64, error: WorkerError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Wire representation using the `status` envelope
    pub fn to_value(&self) -> Value {
        let mut envelope = Map::new();
        envelope.insert("id".into(), Value::from(self.id));
        match &self.outcome {
            Ok(result) => {
                envelope.insert("status".into(), Value::from("ok"));
                envelope.insert("result".into(), result.clone());
            }
            Err(error) => {
                envelope.insert("status".into(), Value::from("error"));
                // WorkerError serialization cannot fail: only strings and JSON values
                envelope.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(envelope)
    }
}
