//! Protocol-level error definitions.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading, writing or dispatching Diameter messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first header byte was not the supported protocol version.
    #[error("invalid diameter version {0}")]
    InvalidVersion(u8),

    /// The header length field cannot describe a valid message.
    #[error("invalid message length {0}")]
    InvalidLength(u32),

    /// Underlying transport failure, including short reads.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dictionary has no entry for this command.
    #[error("command not found: application {application_id}, code {command_code}")]
    CommandNotFound {
        application_id: u32,
        command_code: u32,
    },

    /// No message arrived before the read deadline.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The write did not complete before the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// No handler was registered for the message.
    #[error("unhandled message")]
    UnhandledMessage,

    /// The connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// True when the peer ended the stream at a message boundary.
    ///
    /// This is the orderly way for a connection to end and is never
    /// reported as a fault.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::InvalidVersion(_) => "invalid_version",
            ProtocolError::InvalidLength(_) => "invalid_length",
            ProtocolError::Io(_) => "io",
            ProtocolError::CommandNotFound { .. } => "command_not_found",
            ProtocolError::ReadTimeout(_) => "read_timeout",
            ProtocolError::WriteTimeout(_) => "write_timeout",
            ProtocolError::UnhandledMessage => "unhandled_message",
            ProtocolError::ConnectionClosed => "connection_closed",
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
