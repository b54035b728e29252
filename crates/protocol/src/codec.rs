//! Frame and payload encoding
//!
//! Encoding turns a request into a JSON payload and, optionally, a complete
//! length-prefixed frame. Decoding classifies every failure so the channel
//! knows whether the stream is still usable:
//!
//! | Failure | Remediation |
//! |---------|-------------|
//! | payload is valid UTF-8 but not parseable JSON | [`Remediation::Continue`] |
//! | JSON parses but the envelope is wrong | [`Remediation::Continue`] |
//! | payload is not UTF-8 / not JSON text at all | [`Remediation::RestartChannel`] |

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::message::{Request, Response, WorkerError};

/// Largest payload accepted from a worker (64 MiB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// What the channel should do after a decode failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Drop the frame and keep reading
    Continue,

    /// The stream can no longer be trusted; close the channel
    RestartChannel,
}

/// Errors produced while encoding a request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("request id must be positive")]
    InvalidId,

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("request args must be a JSON object, got {0}")]
    ArgsNotAnObject(&'static str),

    #[error("payload serialization failed: {0}")]
    Serialization(String),

    #[error("payload of {size} bytes exceeds the {limit} byte frame limit")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Errors produced while decoding a frame or payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { id: Option<u64>, reason: String },

    #[error("wrong encoding: {reason}")]
    WrongEncoding { reason: String },
}

impl DecodeError {
    /// Channel action for this failure
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MalformedPayload { .. } | Self::InvalidEnvelope { .. } => Remediation::Continue,
            Self::WrongEncoding { .. } => Remediation::RestartChannel,
        }
    }

    /// Request id recovered from a structurally invalid envelope, if any
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::InvalidEnvelope { id, .. } => *id,
            _ => None,
        }
    }

    fn envelope(id: Option<u64>, reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            id,
            reason: reason.into(),
        }
    }
}

/// Encode a request as a JSON payload (no length prefix)
pub fn encode_request_payload(id: u64, command: &str, args: &Value) -> Result<Bytes, EncodeError> {
    if id == 0 {
        return Err(EncodeError::InvalidId);
    }
    if command.is_empty() {
        return Err(EncodeError::EmptyCommand);
    }
    let args = match args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => return Err(EncodeError::ArgsNotAnObject(json_type_name(other))),
    };

    let request = Request::new(id, command).with_args(args);
    let payload =
        serde_json::to_vec(&request).map_err(|e| EncodeError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(EncodeError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_LENGTH,
        });
    }
    Ok(Bytes::from(payload))
}

/// Encode a request as a complete length-prefixed frame
pub fn encode_request(id: u64, command: &str, args: &Value) -> Result<Bytes, EncodeError> {
    let payload = encode_request_payload(id, command, args)?;
    frame(&payload)
}

/// Encode a response payload using the `status` envelope
pub fn encode_response_payload(response: &Response) -> Result<Bytes, EncodeError> {
    serde_json::to_vec(&response.to_value())
        .map(Bytes::from)
        .map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Prefix a payload with its 4-byte big-endian length
pub fn frame(payload: &[u8]) -> Result<Bytes, EncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| EncodeError::FrameTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Strip the length prefix from a complete frame
///
/// The prefix must describe exactly the remaining bytes.
pub fn unframe(frame: &[u8]) -> Result<&[u8], DecodeError> {
    if frame.len() < LENGTH_PREFIX_BYTES {
        return Err(DecodeError::WrongEncoding {
            reason: format!("frame of {} bytes has no length prefix", frame.len()),
        });
    }
    let (prefix, payload) = frame.split_at(LENGTH_PREFIX_BYTES);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared != payload.len() {
        return Err(DecodeError::WrongEncoding {
            reason: format!(
                "length prefix declares {declared} bytes but frame carries {}",
                payload.len()
            ),
        });
    }
    Ok(payload)
}

/// Decode a worker response payload
pub fn decode_response(payload: &[u8]) -> Result<Response, DecodeError> {
    let object = parse_object(payload)?;

    let id = match object.get("id") {
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|id| *id > 0)
            .ok_or_else(|| DecodeError::envelope(None, format!("id {n} is not a positive integer")))?,
        Some(other) => {
            return Err(DecodeError::envelope(
                None,
                format!("id must be a number, got {}", json_type_name(other)),
            ))
        }
        None => return Err(DecodeError::envelope(None, "missing id")),
    };

    let succeeded = match (object.get("status"), object.get("success")) {
        (Some(Value::String(status)), _) if status == "ok" => true,
        (Some(Value::String(status)), _) if status == "error" => false,
        (Some(other), _) => {
            return Err(DecodeError::envelope(
                Some(id),
                format!("unknown status {other}"),
            ))
        }
        (None, Some(Value::Bool(success))) => *success,
        (None, Some(other)) => {
            return Err(DecodeError::envelope(
                Some(id),
                format!("success must be a boolean, got {}", json_type_name(other)),
            ))
        }
        (None, None) => return Err(DecodeError::envelope(Some(id), "missing status")),
    };

    if succeeded {
        let result = object.get("result").cloned().unwrap_or(Value::Null);
        return Ok(Response::ok(id, result));
    }

    let error = match object.get("error") {
        Some(value) => parse_worker_error(value)
            .ok_or_else(|| DecodeError::envelope(Some(id), "error must be a string or object"))?,
        None => return Err(DecodeError::envelope(Some(id), "error response without error")),
    };
    Ok(Response::error(id, error))
}

/// Decode a request payload (the worker side of the protocol)
pub fn decode_request(payload: &[u8]) -> Result<Request, DecodeError> {
    let object = parse_object(payload)?;
    let id = object.get("id").and_then(Value::as_u64).filter(|id| *id > 0);
    serde_json::from_value(Value::Object(object)).map_err(|e| DecodeError::InvalidEnvelope {
        id,
        reason: e.to_string(),
    })
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|e| DecodeError::WrongEncoding {
        reason: format!("payload is not UTF-8: {e}"),
    })?;
    if !looks_like_json(text) {
        return Err(DecodeError::WrongEncoding {
            reason: "payload is not JSON text".to_string(),
        });
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(DecodeError::envelope(
            None,
            format!("envelope must be an object, got {}", json_type_name(&other)),
        )),
        Err(e) => Err(DecodeError::MalformedPayload {
            reason: e.to_string(),
        }),
    }
}

/// Cheap check on the first significant byte; anything that cannot start a
/// JSON document means the peer is writing something other than this protocol.
fn looks_like_json(text: &str) -> bool {
    match text.trim_start().as_bytes().first() {
        Some(b'{' | b'[' | b'"' | b'-' | b'0'..=b'9' | b't' | b'f' | b'n') => true,
        _ => false,
    }
}

fn parse_worker_error(value: &Value) -> Option<WorkerError> {
    match value {
        Value::String(message) => Some(WorkerError::new(message.clone())),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
