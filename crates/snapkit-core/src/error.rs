//! Error handling for SnapKit
//!
//! Error types for each layer of the communication stack:
//! - Connection errors (transport / OS / HTTP level)
//! - Protocol errors (frame encoding and decoding)
//! - Controller errors (command execution against a connected machine)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Transport-level failures reported by the serial and networked carriers.
/// Each variant maps onto a short [`code`](ConnectionError::code) so callers
/// can branch on the failure class without matching on messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Remote host could not be reached
    #[error("Host unreachable: {host}")]
    HostUnreachable {
        /// Host or address that was unreachable.
        host: String,
    },

    /// Connection was reset by the peer
    #[error("Connection reset: {reason}")]
    ConnectionReset {
        /// Reason reported by the OS or HTTP layer.
        reason: String,
    },

    /// Connection refused by the peer
    #[error("Connection refused: {host}")]
    ConnectionRefused {
        /// Host that refused the connection.
        host: String,
    },

    /// Local address not available
    #[error("Address not available: {address}")]
    AddressUnavailable {
        /// The address that could not be bound or used.
        address: String,
    },

    /// Connection aborted locally
    #[error("Connection aborted: {reason}")]
    ConnectionAborted {
        /// Reason the connection was aborted.
        reason: String,
    },

    /// Machine rejected the session (version mismatch or already occupied)
    #[error("Forbidden: {reason}")]
    Forbidden {
        /// Reason returned by the machine.
        reason: String,
    },

    /// Requested endpoint or resource does not exist
    #[error("Not found: {resource}")]
    NotFound {
        /// The missing resource.
        resource: String,
    },

    /// Session token is no longer accepted
    #[error("Unauthorized: session token rejected")]
    Unauthorized,

    /// Operation timed out
    #[error("Connection timeout after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Serial port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open serial port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// A connect attempt was superseded before it settled
    #[error("Connection cancelled")]
    Cancelled,

    /// Another connect attempt is still in flight
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// A different machine is already connected
    #[error("Already connected to {name}")]
    AlreadyConnected {
        /// Name of the connected machine.
        name: String,
    },

    /// No machine is connected
    #[error("Not connected")]
    NotConnected,

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },

    /// Generic HTTP failure not covered above
    #[error("HTTP error: {reason}")]
    Http {
        /// The reason for the failure.
        reason: String,
    },

    /// Generic connection error
    #[error("Connection error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

impl ConnectionError {
    /// Short error code in the style of the OS / HTTP layer
    pub fn code(&self) -> &'static str {
        match self {
            Self::HostUnreachable { .. } => "EHOSTUNREACH",
            Self::ConnectionReset { .. } => "ECONNRESET",
            Self::ConnectionRefused { .. } => "ECONNREFUSED",
            Self::AddressUnavailable { .. } => "EADDRNOTAVAIL",
            Self::ConnectionAborted { .. } => "ECONNABORTED",
            Self::Forbidden { .. } => "403",
            Self::NotFound { .. } => "404",
            Self::Unauthorized => "401",
            Self::Timeout { .. } => "ETIMEDOUT",
            Self::PortNotFound { .. } => "ENOENT",
            Self::FailedToOpen { .. } => "EIO",
            Self::Cancelled => "ECANCELED",
            Self::ConnectInProgress => "EINPROGRESS",
            Self::AlreadyConnected { .. } => "EISCONN",
            Self::NotConnected => "ENOTCONN",
            Self::InvalidParameters { .. } => "EINVAL",
            Self::Http { .. } | Self::Other { .. } => "EUNKNOWN",
        }
    }
}

/// Protocol error type
///
/// Errors produced by the frame codec. The stream reassembler never returns
/// these; it drops corrupt frames and counts them instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer handed to the parser was empty
    #[error("Empty frame")]
    EmptyFrame,

    /// Frame shorter than its header requires
    #[error("Frame too short: {len} bytes")]
    FrameTooShort {
        /// Actual length of the buffer.
        len: usize,
    },

    /// Content does not fit the 16-bit length field
    #[error("Content too long for a frame: {len} bytes")]
    ContentTooLong {
        /// Content length that was rejected.
        len: usize,
    },

    /// Checksum over the payload did not match
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum computed locally.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// Response did not carry what the request expected
    #[error("Unexpected response: {reason}")]
    UnexpectedResponse {
        /// Description of the mismatch.
        reason: String,
    },
}

/// Controller error type
///
/// Errors raised while executing commands against a connected machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// No response arrived before the deadline
    #[error("Controller operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Command was rejected by the machine
    #[error("Command rejected: {reason}")]
    CommandRejected {
        /// The reason the command was rejected.
        reason: String,
    },

    /// Operation is not available on this transport
    #[error("{operation} is not supported over {transport}")]
    Unsupported {
        /// The operation that was requested.
        operation: String,
        /// The transport it was requested on.
        transport: String,
    },

    /// Pending request was dropped before a response arrived
    #[error("Request {request_id} was abandoned")]
    Abandoned {
        /// Id of the abandoned request.
        request_id: u32,
    },
}

/// Main error type for SnapKit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a cancelled connect attempt
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Cancelled))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Controller(ControllerError::Timeout { .. })
                | Error::Connection(ConnectionError::Timeout { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Short error code, if the error has one
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::Connection(e) => Some(e.code()),
            Error::Controller(ControllerError::Timeout { .. }) => Some("ETIMEDOUT"),
            Error::Io(_) => Some("EIO"),
            _ => None,
        }
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
