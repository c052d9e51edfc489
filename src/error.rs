//! Engine error types.
//!
//! # Error Classification
//!
//! Errors fall into four families, matching how the engine reacts to them:
//!
//! - **Transport**: connect failure, write failure, unexpected close. Always
//!   fatal to the connection involved.
//! - **Protocol**: a reply carrying a server error code. Routed to the
//!   originating transaction, then classified as transient or fatal.
//! - **Malformed frame**: a line that cannot be parsed. Logged and discarded.
//! - **Payload truncation**: the stream ended while a declared payload was
//!   still being collected. Treated exactly like a transport close.
//!
//! Only [`ErrorKind`] crosses the Session boundary; everything below the
//! Session reports through [`EngineError`].

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Closed taxonomy surfaced on the Session error signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// DNS resolution or TCP connect failed.
    ConnectFailed,
    /// Reading from a socket failed.
    ReadError,
    /// Writing to a socket failed.
    WriteError,
    /// Peer closed the stream while the engine still expected data.
    UnexpectedClose,
    /// Server refused every offered protocol version.
    UnsupportedVersion,
    /// Account identifier or credential was rejected.
    BadCredentials,
    /// Server reported it is too busy; the session may continue.
    ServerBusy,
    /// Server is unavailable or going down.
    ServerUnavailable,
    /// The external ticket exchange failed.
    AuthenticationFailed,
    /// A redirect reply named an unusable host or port.
    InvalidRedirect,
    /// A login step or transaction deadline expired.
    Timeout,
    /// The account signed on from another location.
    SignedOnElsewhere,
    /// The server sent something the engine cannot act on.
    ProtocolViolation,
}

impl ErrorKind {
    /// Short, stable name for logs and JSON output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectFailed => "connect_failed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::UnexpectedClose => "unexpected_close",
            Self::UnsupportedVersion => "unsupported_version",
            Self::BadCredentials => "bad_credentials",
            Self::ServerBusy => "server_busy",
            Self::ServerUnavailable => "server_unavailable",
            Self::AuthenticationFailed => "authentication_failed",
            Self::InvalidRedirect => "invalid_redirect",
            Self::Timeout => "timeout",
            Self::SignedOnElsewhere => "signed_on_elsewhere",
            Self::ProtocolViolation => "protocol_violation",
        }
    }

    /// Whether the session can keep running after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServerBusy)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Connecting to a remote endpoint failed.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Socket write failed; the connection is unusable.
    #[error("Write failed: {0}")]
    Write(String),

    /// Socket read failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// Remote closed the stream.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Stream ended while a declared payload was incomplete.
    #[error("Payload truncated: expected {expected} bytes, got {received}")]
    PayloadTruncated {
        /// Declared payload length.
        expected: usize,
        /// Bytes collected before the stream ended.
        received: usize,
    },

    /// Line could not be parsed per the command grammar.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Operation is not valid in the current connection or login state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Login state machine refused a transition.
    #[error("Invalid login transition: {from} -> {to}")]
    InvalidTransition {
        /// Current step name.
        from: String,
        /// Requested step name.
        to: String,
    },

    /// Server replied with an error code.
    #[error("Server error {code}: {description}")]
    Server {
        /// Numeric reply code.
        code: u16,
        /// Human-readable description.
        description: String,
    },

    /// Ticket exchange failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Unknown peer identity or no usable peer address.
    #[error("Peer error: {0}")]
    Peer(String),

    /// Output buffer limit exceeded.
    #[error("Output buffer full: {buffered} bytes queued (limit {limit})")]
    BufferFull {
        /// Bytes currently queued.
        buffered: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Map an error onto the Session-level taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) => ErrorKind::ConnectFailed,
            Self::Write(_) | Self::BufferFull { .. } => ErrorKind::WriteError,
            Self::Read(_) | Self::Io(_) => ErrorKind::ReadError,
            Self::Closed(_) | Self::PayloadTruncated { .. } => ErrorKind::UnexpectedClose,
            Self::Server { code, .. } => crate::protocol::ServerError::lookup(*code)
                .and_then(|e| e.kind)
                .unwrap_or(ErrorKind::ProtocolViolation),
            Self::Authentication(_) => ErrorKind::AuthenticationFailed,
            Self::MalformedFrame(_)
            | Self::InvalidState(_)
            | Self::InvalidTransition { .. }
            | Self::Peer(_)
            | Self::Config(_)
            | Self::Json(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// Whether this error ends the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Write(_)
                | Self::Read(_)
                | Self::Closed(_)
                | Self::PayloadTruncated { .. }
                | Self::BufferFull { .. }
                | Self::Io(_)
        )
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Authentication(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_fatal() {
        assert!(EngineError::Write("broken pipe".into()).is_connection_fatal());
        assert!(EngineError::PayloadTruncated {
            expected: 10,
            received: 3
        }
        .is_connection_fatal());
        assert!(!EngineError::MalformedFrame("x".into()).is_connection_fatal());
    }

    #[test]
    fn test_truncation_maps_to_unexpected_close() {
        let err = EngineError::PayloadTruncated {
            expected: 200,
            received: 120,
        };
        assert_eq!(err.kind(), ErrorKind::UnexpectedClose);
    }

    #[test]
    fn test_server_error_kind() {
        let err = EngineError::Server {
            code: 911,
            description: "authentication failed".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BadCredentials);
        assert!(ErrorKind::ServerBusy.is_transient());
        assert!(!ErrorKind::BadCredentials.is_transient());
    }
}
