//! Fragment reassembly, one buffer per (peer, reliability).

use crate::error::{TransportError, TransportResult};
use tern_proto::zint::Reader;
use tern_proto::NetworkMessage;

/// Upper bound on a reassembled network message.
pub const FRAG_MAX_SIZE: usize = 300_000;

/// Accumulates a Fragment chain. All fragments of a chain carry the same
/// sequence number; a mismatching SN, an overrun or a trailing-garbage
/// decode aborts the chain.
#[derive(Debug, Default)]
pub struct DefragBuffer {
    sn: Option<u64>,
    buf: Vec<u8>,
}

impl DefragBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.sn.is_some()
    }

    pub fn clear(&mut self) {
        self.sn = None;
        self.buf.clear();
    }

    /// Feed one fragment. Returns the reassembled message once the final
    /// fragment (`more == false`) lands.
    pub fn push(
        &mut self,
        sn: u64,
        more: bool,
        payload: &[u8],
    ) -> TransportResult<Option<NetworkMessage>> {
        match self.sn {
            None => self.sn = Some(sn),
            Some(chain_sn) if chain_sn != sn => {
                self.clear();
                return Err(TransportError::Protocol("fragment chain sn mismatch"));
            }
            Some(_) => {}
        }
        if self.buf.len() + payload.len() > FRAG_MAX_SIZE {
            self.clear();
            return Err(TransportError::Protocol("fragment chain overran limit"));
        }
        self.buf.extend_from_slice(payload);
        if more {
            return Ok(None);
        }
        let mut r = Reader::new(&self.buf);
        let msg = NetworkMessage::decode(&mut r);
        let trailing = !r.is_empty();
        self.clear();
        let msg = msg?;
        if trailing {
            return Err(TransportError::Protocol("trailing bytes after fragment chain"));
        }
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::frame_network;
    use tern_proto::core::{Encoding, Priority, WireExpr};
    use tern_proto::network::PushBody;
    use tern_proto::TransportMessage;

    #[test]
    fn chain_reassembles() {
        let msg = NetworkMessage::Push {
            wire_expr: WireExpr::from_str("demo/blob").to_owned(),
            qos: Priority::default(),
            body: PushBody::Put {
                timestamp: None,
                encoding: Encoding::default(),
                payload: vec![7; 4000],
                attachment: None,
            },
        };
        let batches = frame_network(&msg, true, 5, 512).unwrap();
        assert!(batches.len() > 1);
        let mut defrag = DefragBuffer::new();
        let mut out = None;
        for batch in &batches {
            let mut r = Reader::new(batch);
            match TransportMessage::decode(&mut r).unwrap() {
                TransportMessage::Fragment {
                    sn, more, payload, ..
                } => {
                    if let Some(m) = defrag.push(sn, more, &payload).unwrap() {
                        out = Some(m);
                    }
                }
                other => panic!("expected Fragment, got {other:?}"),
            }
        }
        assert_eq!(out.unwrap(), msg);
        assert!(!defrag.is_active());
    }

    #[test]
    fn overrun_aborts_chain() {
        let mut defrag = DefragBuffer::new();
        let piece = vec![0u8; 100_001];
        assert!(defrag.push(0, true, &piece).unwrap().is_none());
        assert!(defrag.push(0, true, &piece).unwrap().is_none());
        assert!(defrag.push(0, true, &piece).unwrap().is_none());
        // The fourth piece crosses FRAG_MAX_SIZE.
        assert!(defrag.push(0, true, &piece).is_err());
        assert!(!defrag.is_active());
    }

    #[test]
    fn sn_mismatch_aborts_chain() {
        let mut defrag = DefragBuffer::new();
        assert!(defrag.push(1, true, &[1, 2, 3]).unwrap().is_none());
        assert!(defrag.push(2, false, &[4]).is_err());
        assert!(!defrag.is_active());
    }
}
