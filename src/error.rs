//! Connection-level error classification.
//!
//! Each layer has its own error enum; [`ErrorKind`] is the common vocabulary
//! the connection driver uses to decide whether a failure still deserves a
//! response or simply ends the connection.

use std::fmt;

/// Broad category of a connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A delimiter never arrived within the window, or a record/body is malformed.
    Framing,
    /// Bytes were well-formed but not valid at this point of the protocol.
    Protocol,
    /// The request parsed but is not acceptable (missing `Host`, no length, ...).
    Validation,
    /// The socket or the upload storage failed.
    Transport,
}

impl ErrorKind {
    /// Whether the connection must be closed without writing a response.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Framing => "framing",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::Transport => "transport",
        })
    }
}
