//! Scouting and transport-level messages.
//!
//! Ids are stable 5-bit values; flag bits 7..5 are per-message. Bit 7 (`Z`)
//! always means "an extension chain follows the body prologue".

use crate::core::{WhatAmI, WhatAmIMatcher, ZId};
use crate::error::{ProtoError, ProtoResult};
use crate::ext::{self, ZExt};
use crate::network::NetworkMessage;
use crate::zint::{Reader, Writer};

pub mod id {
    pub const SCOUT: u8 = 0x01;
    pub const HELLO: u8 = 0x02;
    pub const INIT: u8 = 0x03;
    pub const OPEN: u8 = 0x04;
    pub const CLOSE: u8 = 0x05;
    pub const KEEPALIVE: u8 = 0x06;
    pub const JOIN: u8 = 0x07;
    pub const FRAME: u8 = 0x08;
    pub const FRAGMENT: u8 = 0x09;
}

pub const ID_MASK: u8 = 0x1f;
pub const FLAG_Z: u8 = 0x80;

mod flag {
    /// Scout/Hello: a ZId follows. Init/Open: this is the Ack direction.
    pub const A: u8 = 0x20;
    pub const I: u8 = 0x20;
    pub const L: u8 = 0x20;
    /// Close: whole session, not just this link.
    pub const S: u8 = 0x20;
    /// Open/Join: lease is expressed in seconds.
    pub const T: u8 = 0x40;
    /// Frame/Fragment: reliable channel.
    pub const R: u8 = 0x20;
    /// Fragment: more fragments follow.
    pub const M: u8 = 0x40;
}

/// Extension id carrying credentials on Init.
pub const EXT_AUTH: u8 = 0x01;

/// Reasons carried by Close.
pub mod close_reason {
    pub const GENERIC: u8 = 0;
    pub const UNSUPPORTED: u8 = 1;
    pub const INVALID: u8 = 2;
    pub const MAX_SESSIONS: u8 = 3;
    pub const EXPIRED: u8 = 4;
}

/// A Close reason byte, kept as a newtype for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason(pub u8);

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            close_reason::GENERIC => "generic",
            close_reason::UNSUPPORTED => "unsupported",
            close_reason::INVALID => "invalid",
            close_reason::MAX_SESSIONS => "max sessions",
            close_reason::EXPIRED => "lease expired",
            _ => "unknown",
        };
        write!(f, "{name} ({})", self.0)
    }
}

/// Pre-shared credentials, sent as a mandatory Init extension. A receiver
/// that does not support the scheme must refuse the session rather than
/// silently ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    UserPassword { user: String, password: String },
    Token(Vec<u8>),
}

impl Auth {
    fn encode_body(&self) -> ProtoResult<Vec<u8>> {
        let mut w = Writer::unbounded();
        match self {
            Auth::UserPassword { user, password } => {
                w.write_u8(1)?;
                w.write_string(user)?;
                w.write_string(password)?;
            }
            Auth::Token(token) => {
                w.write_u8(2)?;
                w.write_bytes(token)?;
            }
        }
        Ok(w.into_vec())
    }

    fn decode_body(body: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(body);
        match r.read_u8()? {
            1 => Ok(Auth::UserPassword {
                user: r.read_string()?,
                password: r.read_string()?,
            }),
            2 => Ok(Auth::Token(r.read_bytes()?.to_vec())),
            _ => Err(ProtoError::Malformed("auth scheme")),
        }
    }
}

/// Next sequence numbers per reliability class, announced by Join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConduitSn {
    pub reliable: u64,
    pub best_effort: u64,
}

/// The transport message catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Scout {
        version: u8,
        what: WhatAmIMatcher,
        zid: Option<ZId>,
    },
    Hello {
        version: u8,
        whatami: WhatAmI,
        zid: ZId,
        locators: Vec<String>,
    },
    InitSyn {
        version: u8,
        whatami: WhatAmI,
        zid: ZId,
        sn_bits: u8,
        batch_size: u16,
        auth: Option<Auth>,
    },
    InitAck {
        version: u8,
        whatami: WhatAmI,
        zid: ZId,
        sn_bits: u8,
        batch_size: u16,
        cookie: Vec<u8>,
    },
    OpenSyn {
        lease_ms: u64,
        initial_sn: u64,
        cookie: Vec<u8>,
    },
    OpenAck {
        lease_ms: u64,
        initial_sn: u64,
    },
    Close {
        reason: CloseReason,
        session: bool,
    },
    KeepAlive,
    Join {
        version: u8,
        whatami: WhatAmI,
        zid: ZId,
        lease_ms: u64,
        next_sn: ConduitSn,
    },
    Frame {
        reliable: bool,
        sn: u64,
        payload: Vec<NetworkMessage>,
    },
    Fragment {
        reliable: bool,
        more: bool,
        sn: u64,
        payload: Vec<u8>,
    },
}

fn encode_lease(w: &mut Writer, lease_ms: u64, seconds: bool) -> ProtoResult<()> {
    if seconds {
        w.write_zint(lease_ms / 1000)
    } else {
        w.write_zint(lease_ms)
    }
}

fn decode_lease(r: &mut Reader<'_>, seconds: bool) -> ProtoResult<u64> {
    let v = r.read_zint()?;
    if seconds {
        v.checked_mul(1000)
            .ok_or(ProtoError::Malformed("lease overflow"))
    } else {
        Ok(v)
    }
}

/// Whole seconds encode smaller under the `T` flag; picking the flag from
/// the value keeps the encoding deterministic.
fn lease_in_seconds(lease_ms: u64) -> bool {
    lease_ms >= 1000 && lease_ms % 1000 == 0
}

impl TransportMessage {
    pub fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        match self {
            TransportMessage::Scout { version, what, zid } => {
                let mut header = id::SCOUT;
                if zid.is_some() {
                    header |= flag::I;
                }
                w.write_u8(header)?;
                w.write_u8(*version)?;
                w.write_u8(what.0)?;
                if let Some(zid) = zid {
                    zid.encode(w)?;
                }
            }
            TransportMessage::Hello {
                version,
                whatami,
                zid,
                locators,
            } => {
                let mut header = id::HELLO;
                if !locators.is_empty() {
                    header |= flag::L;
                }
                w.write_u8(header)?;
                w.write_u8(*version)?;
                w.write_u8(whatami.mask())?;
                zid.encode(w)?;
                if !locators.is_empty() {
                    w.write_zint(locators.len() as u64)?;
                    for loc in locators {
                        w.write_string(loc)?;
                    }
                }
            }
            TransportMessage::InitSyn {
                version,
                whatami,
                zid,
                sn_bits,
                batch_size,
                auth,
            } => {
                let mut header = id::INIT;
                if auth.is_some() {
                    header |= FLAG_Z;
                }
                w.write_u8(header)?;
                w.write_u8(*version)?;
                w.write_u8(whatami.mask())?;
                zid.encode(w)?;
                w.write_u8(*sn_bits)?;
                w.write_u16_le(*batch_size)?;
                if let Some(auth) = auth {
                    let body = auth.encode_body()?;
                    ext::encode(w, &[ZExt::new(EXT_AUTH, true, body)])?;
                }
            }
            TransportMessage::InitAck {
                version,
                whatami,
                zid,
                sn_bits,
                batch_size,
                cookie,
            } => {
                w.write_u8(id::INIT | flag::A)?;
                w.write_u8(*version)?;
                w.write_u8(whatami.mask())?;
                zid.encode(w)?;
                w.write_u8(*sn_bits)?;
                w.write_u16_le(*batch_size)?;
                w.write_bytes(cookie)?;
            }
            TransportMessage::OpenSyn {
                lease_ms,
                initial_sn,
                cookie,
            } => {
                let seconds = lease_in_seconds(*lease_ms);
                let mut header = id::OPEN;
                if seconds {
                    header |= flag::T;
                }
                w.write_u8(header)?;
                encode_lease(w, *lease_ms, seconds)?;
                w.write_zint(*initial_sn)?;
                w.write_bytes(cookie)?;
            }
            TransportMessage::OpenAck {
                lease_ms,
                initial_sn,
            } => {
                let seconds = lease_in_seconds(*lease_ms);
                let mut header = id::OPEN | flag::A;
                if seconds {
                    header |= flag::T;
                }
                w.write_u8(header)?;
                encode_lease(w, *lease_ms, seconds)?;
                w.write_zint(*initial_sn)?;
            }
            TransportMessage::Close { reason, session } => {
                let mut header = id::CLOSE;
                if *session {
                    header |= flag::S;
                }
                w.write_u8(header)?;
                w.write_u8(reason.0)?;
            }
            TransportMessage::KeepAlive => {
                w.write_u8(id::KEEPALIVE)?;
            }
            TransportMessage::Join {
                version,
                whatami,
                zid,
                lease_ms,
                next_sn,
            } => {
                let seconds = lease_in_seconds(*lease_ms);
                let mut header = id::JOIN;
                if seconds {
                    header |= flag::T;
                }
                w.write_u8(header)?;
                w.write_u8(*version)?;
                w.write_u8(whatami.mask())?;
                zid.encode(w)?;
                encode_lease(w, *lease_ms, seconds)?;
                w.write_zint(next_sn.reliable)?;
                w.write_zint(next_sn.best_effort)?;
            }
            TransportMessage::Frame {
                reliable,
                sn,
                payload,
            } => {
                let mut header = id::FRAME;
                if *reliable {
                    header |= flag::R;
                }
                w.write_u8(header)?;
                w.write_zint(*sn)?;
                for msg in payload {
                    msg.encode(w)?;
                }
            }
            TransportMessage::Fragment {
                reliable,
                more,
                sn,
                payload,
            } => {
                let mut header = id::FRAGMENT;
                if *reliable {
                    header |= flag::R;
                }
                if *more {
                    header |= flag::M;
                }
                w.write_u8(header)?;
                w.write_zint(*sn)?;
                w.write_exact(payload)?;
            }
        }
        Ok(())
    }

    /// Decode one transport message. Frame and Fragment consume the rest of
    /// the batch; everything else is self-delimiting.
    pub fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let header = r.read_u8()?;
        let z = header & FLAG_Z != 0;
        match header & ID_MASK {
            id::SCOUT => {
                let version = r.read_u8()?;
                let what = WhatAmIMatcher::decode(r.read_u8()?)?;
                let zid = if header & flag::I != 0 {
                    Some(ZId::decode(r)?)
                } else {
                    None
                };
                skip_unknown_exts(r, z)?;
                Ok(TransportMessage::Scout { version, what, zid })
            }
            id::HELLO => {
                let version = r.read_u8()?;
                let whatami = WhatAmI::decode(r.read_u8()?)?;
                let zid = ZId::decode(r)?;
                let mut locators = Vec::new();
                if header & flag::L != 0 {
                    let n = r.read_zint()?;
                    if n > 64 {
                        return Err(ProtoError::Malformed("locator count"));
                    }
                    for _ in 0..n {
                        locators.push(r.read_string()?);
                    }
                }
                skip_unknown_exts(r, z)?;
                Ok(TransportMessage::Hello {
                    version,
                    whatami,
                    zid,
                    locators,
                })
            }
            id::INIT => {
                let version = r.read_u8()?;
                let whatami = WhatAmI::decode(r.read_u8()?)?;
                let zid = ZId::decode(r)?;
                let sn_bits = r.read_u8()?;
                let batch_size = r.read_u16_le()?;
                if header & flag::A != 0 {
                    let cookie = r.read_bytes()?.to_vec();
                    skip_unknown_exts(r, z)?;
                    Ok(TransportMessage::InitAck {
                        version,
                        whatami,
                        zid,
                        sn_bits,
                        batch_size,
                        cookie,
                    })
                } else {
                    let exts = ext::decode_if(r, z)?;
                    let mut auth = None;
                    ext::visit(&exts, |e| {
                        if e.id == EXT_AUTH {
                            auth = Some(Auth::decode_body(&e.body)?);
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    })?;
                    Ok(TransportMessage::InitSyn {
                        version,
                        whatami,
                        zid,
                        sn_bits,
                        batch_size,
                        auth,
                    })
                }
            }
            id::OPEN => {
                let seconds = header & flag::T != 0;
                let lease_ms = decode_lease(r, seconds)?;
                let initial_sn = r.read_zint()?;
                if header & flag::A != 0 {
                    skip_unknown_exts(r, z)?;
                    Ok(TransportMessage::OpenAck {
                        lease_ms,
                        initial_sn,
                    })
                } else {
                    let cookie = r.read_bytes()?.to_vec();
                    skip_unknown_exts(r, z)?;
                    Ok(TransportMessage::OpenSyn {
                        lease_ms,
                        initial_sn,
                        cookie,
                    })
                }
            }
            id::CLOSE => {
                let reason = CloseReason(r.read_u8()?);
                skip_unknown_exts(r, z)?;
                Ok(TransportMessage::Close {
                    reason,
                    session: header & flag::S != 0,
                })
            }
            id::KEEPALIVE => {
                skip_unknown_exts(r, z)?;
                Ok(TransportMessage::KeepAlive)
            }
            id::JOIN => {
                let seconds = header & flag::T != 0;
                let version = r.read_u8()?;
                let whatami = WhatAmI::decode(r.read_u8()?)?;
                let zid = ZId::decode(r)?;
                let lease_ms = decode_lease(r, seconds)?;
                let next_sn = ConduitSn {
                    reliable: r.read_zint()?,
                    best_effort: r.read_zint()?,
                };
                skip_unknown_exts(r, z)?;
                Ok(TransportMessage::Join {
                    version,
                    whatami,
                    zid,
                    lease_ms,
                    next_sn,
                })
            }
            id::FRAME => {
                let sn = r.read_zint()?;
                let mut payload = Vec::new();
                while !r.is_empty() {
                    payload.push(NetworkMessage::decode(r)?);
                }
                Ok(TransportMessage::Frame {
                    reliable: header & flag::R != 0,
                    sn,
                    payload,
                })
            }
            id::FRAGMENT => {
                let sn = r.read_zint()?;
                let payload = r.read_to_end().to_vec();
                Ok(TransportMessage::Fragment {
                    reliable: header & flag::R != 0,
                    more: header & flag::M != 0,
                    sn,
                    payload,
                })
            }
            other => Err(ProtoError::UnknownMessage(other)),
        }
    }
}

/// Messages we never attach extensions to may still carry some from a newer
/// peer; honor the skip-or-fail rule without retaining them.
fn skip_unknown_exts(r: &mut Reader<'_>, z: bool) -> ProtoResult<()> {
    let exts = ext::decode_if(r, z)?;
    ext::visit(&exts, |_| Ok(false))
}
