//! Core wire types shared by the whole message catalogue.

use crate::error::{ProtoError, ProtoResult};
use crate::zint::{Reader, Writer};
use std::borrow::Cow;
use std::fmt;

/// A participant identifier: 1 to 16 opaque bytes, unique per process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZId {
    len: u8,
    bytes: [u8; ZId::MAX_LEN],
}

impl ZId {
    pub const MAX_LEN: usize = 16;

    pub fn new(slice: &[u8]) -> ProtoResult<Self> {
        if slice.is_empty() || slice.len() > Self::MAX_LEN {
            return Err(ProtoError::Malformed("zid length"));
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            len: slice.len() as u8,
            bytes,
        })
    }

    /// A fresh random 16-byte identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::MAX_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self {
            len: Self::MAX_LEN as u8,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub(crate) fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        w.write_bytes(self.as_slice())
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        Self::new(r.read_bytes()?)
    }
}

impl fmt::Debug for ZId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZId({self})")
    }
}

impl fmt::Display for ZId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_slice() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// What a participant is: router, peer or client. Wire values are a 3-bit
/// one-hot mask so scouting can ask for several kinds at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhatAmI {
    Router,
    Peer,
    Client,
}

impl WhatAmI {
    pub fn mask(self) -> u8 {
        match self {
            WhatAmI::Router => 0b001,
            WhatAmI::Peer => 0b010,
            WhatAmI::Client => 0b100,
        }
    }

    pub(crate) fn decode(v: u8) -> ProtoResult<Self> {
        match v {
            0b001 => Ok(WhatAmI::Router),
            0b010 => Ok(WhatAmI::Peer),
            0b100 => Ok(WhatAmI::Client),
            _ => Err(ProtoError::Malformed("whatami")),
        }
    }
}

impl fmt::Display for WhatAmI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WhatAmI::Router => "router",
            WhatAmI::Peer => "peer",
            WhatAmI::Client => "client",
        })
    }
}

/// A mask of [`WhatAmI`] kinds, used by Scout to say who should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhatAmIMatcher(pub u8);

impl WhatAmIMatcher {
    pub const ROUTER: Self = Self(0b001);
    pub const PEER: Self = Self(0b010);
    pub const CLIENT: Self = Self(0b100);
    pub const ANY: Self = Self(0b111);

    pub fn matches(self, what: WhatAmI) -> bool {
        self.0 & what.mask() != 0
    }

    pub(crate) fn decode(v: u8) -> ProtoResult<Self> {
        if v == 0 || v > 0b111 {
            return Err(ProtoError::Malformed("whatami mask"));
        }
        Ok(Self(v))
    }
}

/// Reliability class of a message or conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    #[default]
    Reliable,
    BestEffort,
}

/// Conduit priority. Plain transports only use [`Priority::Data`]; the
/// value still travels in the QoS extension so peers agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Control = 0,
    RealTime = 1,
    InteractiveHigh = 2,
    InteractiveLow = 3,
    DataHigh = 4,
    #[default]
    Data = 5,
    DataLow = 6,
    Background = 7,
}

impl Priority {
    pub(crate) fn decode(v: u8) -> ProtoResult<Self> {
        match v {
            0 => Ok(Priority::Control),
            1 => Ok(Priority::RealTime),
            2 => Ok(Priority::InteractiveHigh),
            3 => Ok(Priority::InteractiveLow),
            4 => Ok(Priority::DataHigh),
            5 => Ok(Priority::Data),
            6 => Ok(Priority::DataLow),
            7 => Ok(Priority::Background),
            _ => Err(ProtoError::Malformed("priority")),
        }
    }
}

/// Wire timestamp: milliseconds since the UNIX epoch plus the stamping
/// participant. Totally ordered by (time, id) so reply consolidation is
/// deterministic across ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub time_ms: u64,
    pub id: ZId,
}

impl Timestamp {
    pub(crate) fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        w.write_zint(self.time_ms)?;
        self.id.encode(w)
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        Ok(Self {
            time_ms: r.read_zint()?,
            id: ZId::decode(r)?,
        })
    }
}

/// Payload encoding: a one-byte well-known prefix plus an optional suffix.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encoding {
    pub prefix: u8,
    pub suffix: Option<String>,
}

impl Encoding {
    pub const EMPTY: u8 = 0;
    pub const APP_OCTET_STREAM: u8 = 1;
    pub const TEXT_PLAIN: u8 = 2;
    pub const APP_JSON: u8 = 3;

    pub fn text_plain() -> Self {
        Self {
            prefix: Self::TEXT_PLAIN,
            suffix: None,
        }
    }

    pub(crate) fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        // Suffix presence rides on the low bit shifted into the prefix so
        // the common no-suffix case stays a single byte.
        let flag = u64::from(self.suffix.is_some());
        w.write_zint((u64::from(self.prefix) << 1) | flag)?;
        if let Some(s) = &self.suffix {
            w.write_string(s)?;
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let v = r.read_zint()?;
        let prefix = u8::try_from(v >> 1).map_err(|_| ProtoError::Malformed("encoding prefix"))?;
        let suffix = if v & 1 != 0 {
            Some(r.read_string()?)
        } else {
            None
        };
        Ok(Self { prefix, suffix })
    }
}

/// A key expression as it travels on the wire: a resource id prefix
/// (0 = none) plus a suffix string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireExpr<'a> {
    pub scope: u16,
    pub suffix: Cow<'a, str>,
}

impl<'a> WireExpr<'a> {
    pub fn from_str(s: &'a str) -> Self {
        Self {
            scope: 0,
            suffix: Cow::Borrowed(s),
        }
    }

    pub fn from_rid(rid: u16) -> Self {
        Self {
            scope: rid,
            suffix: Cow::Borrowed(""),
        }
    }

    pub fn has_suffix(&self) -> bool {
        !self.suffix.is_empty()
    }

    pub fn to_owned(&self) -> WireExpr<'static> {
        WireExpr {
            scope: self.scope,
            suffix: Cow::Owned(self.suffix.clone().into_owned()),
        }
    }

    /// Body encoding; suffix presence is signalled by the `N` flag in the
    /// enclosing message header, which the caller derives from
    /// [`has_suffix`](WireExpr::has_suffix).
    pub(crate) fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        w.write_zint(u64::from(self.scope))?;
        if self.has_suffix() {
            w.write_string(&self.suffix)?;
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut Reader<'_>, named: bool) -> ProtoResult<WireExpr<'static>> {
        let scope = r.read_zint()?;
        let scope = u16::try_from(scope).map_err(|_| ProtoError::Malformed("rid overflow"))?;
        let suffix = if named { r.read_string()? } else { String::new() };
        if scope == 0 && suffix.is_empty() {
            return Err(ProtoError::Malformed("empty wire expression"));
        }
        Ok(WireExpr {
            scope,
            suffix: Cow::Owned(suffix),
        })
    }
}

/// Which queryables a Request should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTarget {
    #[default]
    BestMatching,
    All,
    AllComplete,
}

impl QueryTarget {
    pub(crate) fn encode(self) -> u8 {
        match self {
            QueryTarget::BestMatching => 0,
            QueryTarget::All => 1,
            QueryTarget::AllComplete => 2,
        }
    }

    pub(crate) fn decode(v: u8) -> ProtoResult<Self> {
        match v {
            0 => Ok(QueryTarget::BestMatching),
            1 => Ok(QueryTarget::All),
            2 => Ok(QueryTarget::AllComplete),
            _ => Err(ProtoError::Malformed("query target")),
        }
    }
}

/// How duplicate replies to one query are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsolidationMode {
    /// Every reply is forwarded.
    None,
    /// Replies older than one already seen for the same key are dropped.
    #[default]
    Monotonic,
    /// Only the newest reply per key survives, flushed at the end.
    Latest,
}
