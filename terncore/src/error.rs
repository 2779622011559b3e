use tern_proto::ProtoError;
use tern_transport::TransportError;
use thiserror::Error;

/// The error taxonomy of the public surface.
#[derive(Debug, Error)]
pub enum TernError {
    /// Malformed key expression, selector or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The feature or link kind is not part of this build.
    #[error("not available: {0}")]
    NotAvailable(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A decoded message violated protocol invariants; the transport that
    /// produced it has been closed.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A deadline elapsed before the operation completed.
    #[error("timed out")]
    Timeout,
    /// A bounded queue or buffer refused the operation; no partial state
    /// was left behind.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("session closed")]
    SessionClosed,
    #[error("system error: {0}")]
    System(&'static str),
}

impl From<TransportError> for TernError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(io) => TernError::Io(io),
            TransportError::Proto(p) => TernError::Protocol(p.to_string()),
            TransportError::Protocol(msg) => TernError::Protocol(msg.to_string()),
            TransportError::InvalidEndpoint(ep) => TernError::InvalidArgument(ep),
            TransportError::NotAvailable(ep) => TernError::NotAvailable(ep),
            TransportError::Closed => TernError::SessionClosed,
            TransportError::Timeout => TernError::Timeout,
            TransportError::QueueFull => TernError::OutOfMemory("transmission queue"),
            TransportError::System(msg) => TernError::System(msg),
        }
    }
}

impl From<ProtoError> for TernError {
    fn from(e: ProtoError) -> Self {
        TernError::Protocol(e.to_string())
    }
}

pub type TernResult<T> = Result<T, TernError>;
