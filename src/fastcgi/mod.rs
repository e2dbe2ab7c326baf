//! FastCGI wire protocol.
//!
//! A front-end server (nginx, Apache, ...) forwards each HTTP request as a
//! sequence of records on a persistent connection:
//!
//! ```text
//!  BEGIN_REQUEST ─▶ PARAMS* ─▶ PARAMS(empty) ─▶ STDIN* ─▶ STDIN(empty)
//!                                                              │
//!              END_REQUEST ◀─ STDOUT* ◀── application ◀────────┘
//! ```
//!
//! - [`record`] encodes and decodes the 8-byte header and the typed bodies.
//! - [`nv`] handles the variable-length name-value pairs used by PARAMS and
//!   GET_VALUES.
//! - [`session`] turns a connection's record stream into the plain HTTP byte
//!   stream the request parser understands, and wraps responses back into
//!   records.
//!
//! Only one request is served per connection at a time; multiplexing is
//! refused.

use thiserror::Error;

use crate::buffer::BufferError;
use crate::error::ErrorKind;

pub mod nv;
pub mod record;
pub mod session;

pub use record::{ProtocolStatus, Record, RecordHeader, RecordType, Role};
pub use session::{Session, SessionEvent, SessionState};

/// Errors produced while decoding or sequencing FastCGI records.
#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("unsupported FastCGI version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed {record_type:?} record: {reason}")]
    MalformedRecord {
        record_type: RecordType,
        reason: &'static str,
    },

    #[error("malformed name-value pair in PARAMS stream")]
    MalformedParams,

    #[error("PARAMS stream exceeds {max} bytes")]
    ParamsTooLarge { max: usize },

    #[error("unexpected record type {record_type} in state {state:?}")]
    UnexpectedRecord { record_type: u8, state: SessionState },

    #[error("request {incoming} started while request {active} is active")]
    Multiplexing { active: u16, incoming: u16 },

    #[error("record for request {got} does not belong to active request {expected}")]
    RequestIdMismatch { expected: u16, got: u16 },

    #[error("no active request to respond to")]
    NoActiveRequest,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl FastCgiError {
    /// Classifies the error for the connection driver.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedRecord { .. }
            | Self::MalformedParams
            | Self::ParamsTooLarge { .. }
            | Self::Buffer(_) => ErrorKind::Framing,
            Self::UnsupportedVersion(_)
            | Self::UnexpectedRecord { .. }
            | Self::Multiplexing { .. }
            | Self::RequestIdMismatch { .. }
            | Self::NoActiveRequest => ErrorKind::Protocol,
        }
    }
}
