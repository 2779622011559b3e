use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// The input violates the message grammar. The payload names the field
    /// or invariant that failed, for logging only.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    /// A 5-bit message id that is not part of the catalogue.
    #[error("unknown message id {0:#04x}")]
    UnknownMessage(u8),
    /// An extension flagged mandatory that this decoder does not understand.
    #[error("unsupported mandatory extension {0:#04x}")]
    MandatoryExtension(u8),
    /// The write cursor ran out of room (batch is full).
    #[error("write buffer overflow")]
    Overflow,
}

pub type ProtoResult<T> = Result<T, ProtoError>;
