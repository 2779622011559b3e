use tern_proto::ProtoError;
use thiserror::Error;

/// Errors raised by links and transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    /// A decoded message violates a transport invariant; the offending
    /// transport is closed.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The endpoint names a link this build does not provide.
    #[error("transport not available: {0}")]
    NotAvailable(String),
    #[error("transport closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    /// The bounded outgoing queue is full; nothing was enqueued.
    #[error("outgoing queue full")]
    QueueFull,
    #[error("system error: {0}")]
    System(&'static str),
}

impl TransportError {
    /// I/O timeouts surface as `WouldBlock`/`TimedOut`; everything else is
    /// a real link failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
