//! Extension TLV chains.
//!
//! Any message whose header has the `Z` bit set is followed by a chain of
//! extensions. Each extension is a header byte `|M|X|id[5:0]|` (`M` = more
//! extensions follow, `X` = mandatory), a varint length and a body. A
//! decoder that meets an unknown extension skips it when `X` is clear and
//! fails the whole message when it is set.

use crate::error::{ProtoError, ProtoResult};
use crate::zint::{Reader, Writer};
use smallvec::SmallVec;

const FLAG_MORE: u8 = 0x80;
const FLAG_MANDATORY: u8 = 0x40;
const ID_MASK: u8 = 0x3f;

/// One decoded extension, kept as an `(id, mandatory, body)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZExt {
    pub id: u8,
    pub mandatory: bool,
    pub body: Vec<u8>,
}

impl ZExt {
    pub fn new(id: u8, mandatory: bool, body: Vec<u8>) -> Self {
        debug_assert!(id & ID_MASK == id);
        Self {
            id,
            mandatory,
            body,
        }
    }
}

/// Extensions of one message, in wire order.
pub type ExtList = SmallVec<[ZExt; 2]>;

/// Encode `exts` as a chain; the caller must have set the `Z` bit on the
/// message header iff the list is non-empty.
pub fn encode(w: &mut Writer, exts: &[ZExt]) -> ProtoResult<()> {
    for (i, ext) in exts.iter().enumerate() {
        let more = if i + 1 < exts.len() { FLAG_MORE } else { 0 };
        let mandatory = if ext.mandatory { FLAG_MANDATORY } else { 0 };
        w.write_u8(more | mandatory | (ext.id & ID_MASK))?;
        w.write_bytes(&ext.body)?;
    }
    Ok(())
}

/// Decode a chain into a list, preserving order. Whether an id is known is
/// the caller's business; unknown mandatory ids are rejected there so the
/// error can name the message that carried them.
pub fn decode(r: &mut Reader<'_>) -> ProtoResult<ExtList> {
    let mut exts = ExtList::new();
    loop {
        let header = r.read_u8()?;
        let body = r.read_bytes()?.to_vec();
        exts.push(ZExt {
            id: header & ID_MASK,
            mandatory: header & FLAG_MANDATORY != 0,
            body,
        });
        if header & FLAG_MORE == 0 {
            return Ok(exts);
        }
        if exts.len() > 64 {
            return Err(ProtoError::Malformed("extension chain too long"));
        }
    }
}

/// Decode a chain if the `Z` flag was set, otherwise yield an empty list.
pub fn decode_if(r: &mut Reader<'_>, z: bool) -> ProtoResult<ExtList> {
    if z {
        decode(r)
    } else {
        Ok(ExtList::new())
    }
}

/// Walk `exts`, handing each to `known`. The closure returns `false` for
/// ids it does not understand; those are skipped unless mandatory.
pub fn visit(exts: &[ZExt], mut known: impl FnMut(&ZExt) -> ProtoResult<bool>) -> ProtoResult<()> {
    for ext in exts {
        if !known(ext)? && ext.mandatory {
            return Err(ProtoError::MandatoryExtension(ext.id));
        }
    }
    Ok(())
}
