//! # pyfleet worker protocol
//!
//! Wire protocol spoken between the pool and its external worker processes.
//!
//! Every message travels as a frame: a 4-byte unsigned big-endian length
//! followed by exactly that many bytes of UTF-8 JSON.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ length (u32) │ {"id": 7, "command": "ping", "args": {}}     │
//! │  big-endian  │                                              │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Requests carry a process-unique id. Workers answer with
//! `{"id", "status": "ok" | "error", "result" | "error"}`; the legacy
//! `{"success": bool}` envelope emitted by older bridges is accepted too.
//!
//! [`WorkerChannel`] owns one worker's stdio pair, writes requests, and
//! routes every decoded response to the caller waiting on that id through
//! a [`Correlator`].

pub mod channel;
pub mod codec;
pub mod correlation;
pub mod message;

pub use channel::{ChannelConfig, ChannelError, ChannelStats, WorkerChannel};
pub use codec::{
    decode_request, decode_response, encode_request, encode_request_payload,
    encode_response_payload, frame, unframe, DecodeError, EncodeError, Remediation,
    MAX_FRAME_LENGTH,
};
pub use correlation::{next_request_id, Completion, Correlator, RequestIdGenerator};
pub use message::{Request, Response, WorkerError};
