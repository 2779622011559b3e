use proptest::prelude::*;
use tern_proto::core::{Encoding, Priority, QueryTarget, Timestamp, WhatAmI, WireExpr, ZId};
use tern_proto::network::{NetworkMessage, PushBody, QueryBody, ReplyBody, RequestBody, ResponseBody};
use tern_proto::transport::{ConduitSn, TransportMessage};
use tern_proto::zint::{Reader, Writer};
use tern_proto::PROTOCOL_VERSION;

fn zid_strategy() -> impl Strategy<Value = ZId> {
    prop::collection::vec(any::<u8>(), 1..=16).prop_map(|v| ZId::new(&v).unwrap())
}

fn keyexpr_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,8}(/[a-z0-9_]{1,8}){0,3}"
}

fn wire_expr_strategy() -> impl Strategy<Value = WireExpr<'static>> {
    (0u16..4, keyexpr_strategy()).prop_map(|(scope, key)| {
        if scope == 0 {
            WireExpr::from_str(&key).to_owned()
        } else {
            WireExpr {
                scope,
                suffix: format!("/{key}").into(),
            }
        }
    })
}

fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (any::<u64>(), zid_strategy()).prop_map(|(time_ms, id)| Timestamp { time_ms, id })
}

fn push_strategy() -> impl Strategy<Value = NetworkMessage> {
    (
        wire_expr_strategy(),
        prop::option::of(timestamp_strategy()),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::option::of(prop::collection::vec(any::<u8>(), 1..32)),
        prop::bool::ANY,
        prop::bool::ANY,
    )
        .prop_map(|(wire_expr, timestamp, payload, attachment, del, plain)| {
            let body = if del {
                PushBody::Del { timestamp }
            } else {
                PushBody::Put {
                    timestamp,
                    encoding: if plain {
                        Encoding::text_plain()
                    } else {
                        Encoding::default()
                    },
                    payload,
                    attachment,
                }
            };
            NetworkMessage::Push {
                wire_expr,
                qos: if plain { Priority::Data } else { Priority::DataHigh },
                body,
            }
        })
}

fn request_strategy() -> impl Strategy<Value = NetworkMessage> {
    (
        any::<u32>(),
        wire_expr_strategy(),
        prop::sample::select(vec![
            QueryTarget::BestMatching,
            QueryTarget::All,
            QueryTarget::AllComplete,
        ]),
        prop::option::of(1u64..1_000_000),
        "[a-z=;0-9]{0,24}",
    )
        .prop_map(|(qid, wire_expr, target, timeout_ms, parameters)| {
            NetworkMessage::Request {
                qid: qid.into(),
                wire_expr,
                target,
                timeout_ms,
                body: RequestBody::Query(QueryBody {
                    parameters,
                    payload: None,
                }),
            }
        })
}

fn response_strategy() -> impl Strategy<Value = NetworkMessage> {
    (
        any::<u32>(),
        wire_expr_strategy(),
        prop::option::of(zid_strategy()),
        prop::option::of(timestamp_strategy()),
        prop::collection::vec(any::<u8>(), 0..256),
        prop::bool::ANY,
    )
        .prop_map(|(qid, wire_expr, replier, timestamp, payload, err)| {
            let body = if err {
                ResponseBody::Err {
                    payload: payload.clone(),
                }
            } else {
                ResponseBody::Reply(ReplyBody {
                    timestamp,
                    encoding: Encoding::default(),
                    payload,
                })
            };
            NetworkMessage::Response {
                qid: qid.into(),
                wire_expr,
                replier,
                body,
            }
        })
}

fn network_strategy() -> impl Strategy<Value = NetworkMessage> {
    prop_oneof![
        push_strategy(),
        request_strategy(),
        response_strategy(),
        any::<u32>().prop_map(|qid| NetworkMessage::ResponseFinal { qid: qid.into() }),
    ]
}

proptest! {
    /// decode(encode(m)) == m, and re-encoding is byte-identical.
    #[test]
    fn network_roundtrip(msg in network_strategy()) {
        let mut w = Writer::unbounded();
        msg.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let decoded = NetworkMessage::decode(&mut r).unwrap();
        prop_assert!(r.is_empty());
        prop_assert_eq!(&decoded, &msg);
        let mut w2 = Writer::unbounded();
        decoded.encode(&mut w2).unwrap();
        prop_assert_eq!(w2.as_slice(), bytes.as_slice());
    }

    #[test]
    fn frame_roundtrip(
        sn in any::<u32>(),
        reliable in any::<bool>(),
        msgs in prop::collection::vec(network_strategy(), 0..4),
    ) {
        let frame = TransportMessage::Frame {
            reliable,
            sn: sn.into(),
            payload: msgs,
        };
        let mut w = Writer::unbounded();
        frame.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let decoded = TransportMessage::decode(&mut r).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn join_roundtrip(
        lease_ms in 1u64..1_000_000,
        reliable in any::<u64>(),
        best_effort in any::<u64>(),
        zid in zid_strategy(),
    ) {
        let join = TransportMessage::Join {
            version: PROTOCOL_VERSION,
            whatami: WhatAmI::Peer,
            zid,
            lease_ms,
            next_sn: ConduitSn { reliable, best_effort },
        };
        let mut w = Writer::unbounded();
        join.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(TransportMessage::decode(&mut r).unwrap(), join);
    }

    /// Random bytes never panic the decoder: either some prefix decodes and
    /// re-encodes to a prefix of the input, or decoding fails cleanly.
    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut r = Reader::new(&bytes);
        let _ = TransportMessage::decode(&mut r);
        let mut r = Reader::new(&bytes);
        let _ = NetworkMessage::decode(&mut r);
    }
}
