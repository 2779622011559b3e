//! # Tern Proto
//!
//! Deterministic wire codec for the tern pub/sub overlay protocol.
//!
//! The protocol is a self-describing binary grammar: every message starts
//! with a one-byte header (3 flag bits, 5-bit message id), optionally
//! followed by a TLV extension chain, then the message body. Unsigned
//! integers are LEB128 varints.
//!
//! ## Architecture
//!
//! - **Primitives**: varint and cursor types in [`zint`].
//! - **Core types**: identifiers, wire expressions and QoS in [`core`].
//! - **Extensions**: the TLV chain walker in [`ext`].
//! - **Catalogue**: transport/scouting messages in [`transport`],
//!   network messages in [`network`].
//!
//! Identical logical messages always produce byte-identical encodings; the
//! test suite relies on this for its round-trip property.

pub mod core;
pub mod error;
pub mod ext;
pub mod network;
pub mod transport;
pub mod zint;

pub use crate::core::{
    ConsolidationMode, Encoding, Priority, QueryTarget, Reliability, Timestamp, WhatAmI,
    WhatAmIMatcher, WireExpr, ZId,
};
pub use error::{ProtoError, ProtoResult};
pub use ext::ZExt;
pub use network::{
    DeclareBody, NetworkMessage, PushBody, QueryBody, ReplyBody, RequestBody, ResponseBody,
};
pub use transport::{Auth, CloseReason, ConduitSn, TransportMessage};
pub use zint::{Reader, Writer};

/// Wire protocol version carried by Scout/Hello/Init/Join.
pub const PROTOCOL_VERSION: u8 = 0x08;
