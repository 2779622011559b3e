//! Sequence-number arithmetic and batch assembly.

use crate::error::TransportResult;
use tern_proto::zint::{zint_len, Writer};
use tern_proto::{NetworkMessage, TransportMessage};

/// Sequence numbers live on a ring of `1 << bits` values; both sides agree
/// on the ring size during negotiation.
#[derive(Debug, Clone, Copy)]
pub struct SnSpace {
    mask: u64,
}

impl SnSpace {
    pub fn new(bits: u8) -> Self {
        let bits = bits.clamp(8, 63);
        Self {
            mask: (1u64 << bits) - 1,
        }
    }

    pub fn next(&self, sn: u64) -> u64 {
        sn.wrapping_add(1) & self.mask
    }

    /// Whether `sn` is strictly ahead of `base` within the forward
    /// half-window of the ring.
    pub fn precedes(&self, base: u64, sn: u64) -> bool {
        let gap = sn.wrapping_sub(base) & self.mask;
        gap != 0 && gap <= (self.mask >> 1)
    }
}

/// Encode a bare transport message (KeepAlive, Join, handshake) as one batch.
pub fn encode_transport(msg: &TransportMessage, batch_size: u16) -> TransportResult<Vec<u8>> {
    let mut w = Writer::new(batch_size as usize);
    msg.encode(&mut w)?;
    Ok(w.into_vec())
}

/// Wrap a network message in a Frame, or split it into a Fragment chain
/// sharing `sn` when it does not fit one batch.
pub fn frame_network(
    msg: &NetworkMessage,
    reliable: bool,
    sn: u64,
    batch_size: u16,
) -> TransportResult<Vec<Vec<u8>>> {
    let batch_size = batch_size as usize;
    let mut body = Writer::unbounded();
    msg.encode(&mut body)?;
    let body = body.into_vec();

    let overhead = 1 + zint_len(sn);
    if overhead + body.len() <= batch_size {
        let mut w = Writer::new(batch_size);
        TransportMessage::Frame {
            reliable,
            sn,
            payload: Vec::new(),
        }
        .encode(&mut w)?;
        w.write_exact(&body)?;
        return Ok(vec![w.into_vec()]);
    }

    let chunk = batch_size - overhead;
    let mut batches = Vec::with_capacity(body.len().div_ceil(chunk));
    let mut rest = body.as_slice();
    while !rest.is_empty() {
        let take = rest.len().min(chunk);
        let (piece, remainder) = rest.split_at(take);
        rest = remainder;
        let mut w = Writer::new(batch_size);
        TransportMessage::Fragment {
            reliable,
            more: !rest.is_empty(),
            sn,
            payload: piece.to_vec(),
        }
        .encode(&mut w)?;
        batches.push(w.into_vec());
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_proto::core::{Encoding, Priority, WireExpr};
    use tern_proto::network::PushBody;
    use tern_proto::zint::Reader;

    fn push(payload_len: usize) -> NetworkMessage {
        NetworkMessage::Push {
            wire_expr: WireExpr::from_str("demo/example/a").to_owned(),
            qos: Priority::default(),
            body: PushBody::Put {
                timestamp: None,
                encoding: Encoding::default(),
                payload: vec![0x5a; payload_len],
                attachment: None,
            },
        }
    }

    #[test]
    fn sn_ring_wraps() {
        let space = SnSpace::new(8);
        assert_eq!(space.next(254), 255);
        assert_eq!(space.next(255), 0);
        assert!(space.precedes(250, 10));
        assert!(!space.precedes(10, 250));
        assert!(!space.precedes(7, 7));
    }

    #[test]
    fn small_message_is_one_frame() {
        let batches = frame_network(&push(16), true, 0, 2048).unwrap();
        assert_eq!(batches.len(), 1);
        let mut r = Reader::new(&batches[0]);
        match TransportMessage::decode(&mut r).unwrap() {
            TransportMessage::Frame { sn, payload, .. } => {
                assert_eq!(sn, 0);
                assert_eq!(payload.len(), 1);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn oversize_message_fragments_under_one_sn() {
        let batches = frame_network(&push(5000), true, 42, 1024).unwrap();
        assert!(batches.len() > 1);
        for (i, batch) in batches.iter().enumerate() {
            assert!(batch.len() <= 1024);
            let mut r = Reader::new(batch);
            match TransportMessage::decode(&mut r).unwrap() {
                TransportMessage::Fragment { sn, more, .. } => {
                    assert_eq!(sn, 42);
                    assert_eq!(more, i + 1 < batches.len());
                }
                other => panic!("expected Fragment, got {other:?}"),
            }
        }
    }
}
