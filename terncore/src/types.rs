//! Public value types: samples, replies and operation options.

use std::time::Duration;
use tern_proto::core::{ConsolidationMode, Encoding, QueryTarget, Timestamp, ZId};

/// Whether a sample carries data or tombstones a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Put,
    Delete,
}

/// One data sample delivered to a subscriber or carried by a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub keyexpr: String,
    pub payload: Vec<u8>,
    pub kind: SampleKind,
    pub encoding: Encoding,
    pub timestamp: Option<Timestamp>,
    pub attachment: Option<Vec<u8>>,
}

/// A reply to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok { sample: Sample, replier: Option<ZId> },
    Err { payload: Vec<u8> },
}

impl Reply {
    pub fn ok(&self) -> Option<&Sample> {
        match self {
            Reply::Ok { sample, .. } => Some(sample),
            Reply::Err { .. } => None,
        }
    }
}

/// Options for `put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub encoding: Encoding,
    pub attachment: Option<Vec<u8>>,
}

/// Options for `get`.
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub target: QueryTarget,
    pub consolidation: ConsolidationMode,
    pub timeout: Duration,
    pub payload: Option<Vec<u8>>,
    pub encoding: Encoding,
}

/// Default query deadline.
pub const GET_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10_000);

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            target: QueryTarget::default(),
            consolidation: ConsolidationMode::default(),
            timeout: GET_TIMEOUT_DEFAULT,
            payload: None,
            encoding: Encoding::default(),
        }
    }
}
