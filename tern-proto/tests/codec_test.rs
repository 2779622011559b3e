use tern_proto::core::{
    Encoding, Priority, QueryTarget, Timestamp, WhatAmI, WhatAmIMatcher, WireExpr, ZId,
};
use tern_proto::network::{
    DeclareBody, NetworkMessage, PushBody, QueryBody, ReplyBody, RequestBody, ResponseBody,
};
use tern_proto::transport::{Auth, CloseReason, ConduitSn, TransportMessage};
use tern_proto::zint::{Reader, Writer};
use tern_proto::{ProtoError, PROTOCOL_VERSION};

fn roundtrip_transport(msg: &TransportMessage) -> Vec<u8> {
    let mut w = Writer::unbounded();
    msg.encode(&mut w).unwrap();
    let bytes = w.into_vec();
    let mut r = Reader::new(&bytes);
    let decoded = TransportMessage::decode(&mut r).unwrap();
    assert!(r.is_empty(), "decoder left {} trailing bytes", r.remaining());
    assert_eq!(&decoded, msg);
    // Determinism: re-encoding the decoded value is byte-identical.
    let mut w2 = Writer::unbounded();
    decoded.encode(&mut w2).unwrap();
    assert_eq!(w2.as_slice(), bytes.as_slice());
    bytes
}

fn roundtrip_network(msg: &NetworkMessage) {
    let mut w = Writer::unbounded();
    msg.encode(&mut w).unwrap();
    let bytes = w.into_vec();
    let mut r = Reader::new(&bytes);
    let decoded = NetworkMessage::decode(&mut r).unwrap();
    assert!(r.is_empty());
    assert_eq!(&decoded, msg);
    let mut w2 = Writer::unbounded();
    decoded.encode(&mut w2).unwrap();
    assert_eq!(w2.as_slice(), bytes.as_slice());
}

#[test]
fn scouting_messages() {
    let zid = ZId::new(&[0xab; 16]).unwrap();
    roundtrip_transport(&TransportMessage::Scout {
        version: PROTOCOL_VERSION,
        what: WhatAmIMatcher::ROUTER,
        zid: None,
    });
    roundtrip_transport(&TransportMessage::Scout {
        version: PROTOCOL_VERSION,
        what: WhatAmIMatcher::ANY,
        zid: Some(zid),
    });
    roundtrip_transport(&TransportMessage::Hello {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Router,
        zid,
        locators: vec!["tcp/192.168.1.1:7447".into(), "udp/192.168.1.1:7447".into()],
    });
}

#[test]
fn handshake_messages() {
    let zid = ZId::new(&[1, 2, 3]).unwrap();
    roundtrip_transport(&TransportMessage::InitSyn {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Client,
        zid,
        sn_bits: 28,
        batch_size: 2048,
        auth: None,
    });
    roundtrip_transport(&TransportMessage::InitSyn {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Client,
        zid,
        sn_bits: 28,
        batch_size: 2048,
        auth: Some(Auth::UserPassword {
            user: "ahab".into(),
            password: "whale".into(),
        }),
    });
    roundtrip_transport(&TransportMessage::InitSyn {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Client,
        zid,
        sn_bits: 28,
        batch_size: 2048,
        auth: Some(Auth::Token(vec![0xde, 0xad, 0xbe, 0xef])),
    });
    roundtrip_transport(&TransportMessage::InitAck {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Router,
        zid,
        sn_bits: 20,
        batch_size: 1024,
        cookie: vec![9; 32],
    });
    roundtrip_transport(&TransportMessage::OpenSyn {
        lease_ms: 10_000,
        initial_sn: 17,
        cookie: vec![9; 32],
    });
    // A non-whole-second lease must survive unrounded.
    roundtrip_transport(&TransportMessage::OpenAck {
        lease_ms: 2_500,
        initial_sn: 42,
    });
    roundtrip_transport(&TransportMessage::Close {
        reason: CloseReason(4),
        session: true,
    });
    roundtrip_transport(&TransportMessage::KeepAlive);
}

#[test]
fn whole_second_lease_encodes_compact() {
    // 60 s as seconds takes one varint byte; as millis it would take three.
    let msg = TransportMessage::OpenAck {
        lease_ms: 60_000,
        initial_sn: 0,
    };
    let bytes = roundtrip_transport(&msg);
    assert_eq!(bytes.len(), 3); // header + lease(60) + sn(0)
}

#[test]
fn join_and_frame() {
    let zid = ZId::new(&[7; 8]).unwrap();
    roundtrip_transport(&TransportMessage::Join {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Peer,
        zid,
        lease_ms: 10_000,
        next_sn: ConduitSn {
            reliable: 123,
            best_effort: 456,
        },
    });

    let push = NetworkMessage::Push {
        wire_expr: WireExpr::from_str("demo/example/a").to_owned(),
        qos: Priority::default(),
        body: PushBody::Put {
            timestamp: None,
            encoding: Encoding::default(),
            payload: b"hello".to_vec(),
            attachment: None,
        },
    };
    roundtrip_transport(&TransportMessage::Frame {
        reliable: true,
        sn: 0,
        payload: vec![push.clone(), push],
    });
    roundtrip_transport(&TransportMessage::Fragment {
        reliable: true,
        more: true,
        sn: 3,
        payload: vec![0x55; 100],
    });
}

#[test]
fn push_with_rid_and_suffix() {
    // Register key `foo/bar` as RID 1, then push `rid=1, suffix="/baz"`.
    let msg = NetworkMessage::Push {
        wire_expr: WireExpr {
            scope: 1,
            suffix: "/baz".into(),
        },
        qos: Priority::default(),
        body: PushBody::Put {
            timestamp: None,
            encoding: Encoding::default(),
            payload: b"x".to_vec(),
            attachment: None,
        },
    };
    roundtrip_network(&msg);

    let mut w = Writer::unbounded();
    msg.encode(&mut w).unwrap();
    let bytes = w.into_vec();
    let mut r = Reader::new(&bytes);
    match NetworkMessage::decode(&mut r).unwrap() {
        NetworkMessage::Push { wire_expr, .. } => {
            assert_eq!(wire_expr.scope, 1);
            assert_eq!(wire_expr.suffix, "/baz");
        }
        other => panic!("expected Push, got {other:?}"),
    }
}

#[test]
fn network_messages() {
    let zid = ZId::new(&[0x42; 4]).unwrap();
    roundtrip_network(&NetworkMessage::Push {
        wire_expr: WireExpr::from_rid(7).to_owned(),
        qos: Priority::RealTime,
        body: PushBody::Put {
            timestamp: Some(Timestamp {
                time_ms: 1_700_000_000_000,
                id: zid,
            }),
            encoding: Encoding::text_plain(),
            payload: b"payload".to_vec(),
            attachment: Some(b"meta".to_vec()),
        },
    });
    roundtrip_network(&NetworkMessage::Push {
        wire_expr: WireExpr::from_str("demo/tombstone").to_owned(),
        qos: Priority::default(),
        body: PushBody::Del { timestamp: None },
    });
    roundtrip_network(&NetworkMessage::Request {
        qid: 1,
        wire_expr: WireExpr::from_str("demo/**").to_owned(),
        target: QueryTarget::AllComplete,
        timeout_ms: Some(100),
        body: RequestBody::Query(QueryBody {
            parameters: "a=1;bee=string".into(),
            payload: None,
        }),
    });
    roundtrip_network(&NetworkMessage::Request {
        qid: 2,
        wire_expr: WireExpr::from_str("demo/**").to_owned(),
        target: QueryTarget::default(),
        timeout_ms: None,
        body: RequestBody::Query(QueryBody {
            parameters: String::new(),
            payload: Some((Encoding::text_plain(), b"body".to_vec())),
        }),
    });
    roundtrip_network(&NetworkMessage::Response {
        qid: 1,
        wire_expr: WireExpr::from_str("demo/example/a").to_owned(),
        replier: Some(zid),
        body: ResponseBody::Reply(ReplyBody {
            timestamp: Some(Timestamp {
                time_ms: 10,
                id: zid,
            }),
            encoding: Encoding::default(),
            payload: b"reply".to_vec(),
        }),
    });
    roundtrip_network(&NetworkMessage::Response {
        qid: 1,
        wire_expr: WireExpr::from_str("demo/example/a").to_owned(),
        replier: None,
        body: ResponseBody::Err {
            payload: b"no such key".to_vec(),
        },
    });
    roundtrip_network(&NetworkMessage::ResponseFinal { qid: 1 });
    roundtrip_network(&NetworkMessage::Oam {
        oam_id: 0x10,
        body: vec![1, 2, 3],
    });
}

#[test]
fn declare_bodies() {
    let bodies = [
        DeclareBody::KeyExpr {
            rid: 1,
            wire_expr: WireExpr::from_str("foo/bar").to_owned(),
        },
        DeclareBody::KeyExpr {
            rid: 2,
            wire_expr: WireExpr {
                scope: 1,
                suffix: "/baz".into(),
            },
        },
        DeclareBody::UndeclareKeyExpr { rid: 1 },
        DeclareBody::Subscriber {
            id: 10,
            wire_expr: WireExpr::from_str("demo/example/**").to_owned(),
        },
        DeclareBody::UndeclareSubscriber { id: 10 },
        DeclareBody::Queryable {
            id: 11,
            wire_expr: WireExpr::from_str("demo/queryable").to_owned(),
            complete: true,
            distance: 0,
        },
        DeclareBody::UndeclareQueryable { id: 11 },
        DeclareBody::Token {
            id: 12,
            wire_expr: WireExpr::from_str("alive/node-a").to_owned(),
        },
        DeclareBody::UndeclareToken { id: 12 },
        DeclareBody::Final,
    ];
    for body in bodies {
        roundtrip_network(&NetworkMessage::Declare { body });
    }
}

#[test]
fn unknown_message_id_rejected() {
    // 0x1e is unused in the transport id space.
    let mut r = Reader::new(&[0x1e, 0, 0]);
    assert!(matches!(
        TransportMessage::decode(&mut r),
        Err(ProtoError::UnknownMessage(_))
    ));
}

#[test]
fn unknown_mandatory_extension_rejected() {
    // A KeepAlive followed by a mandatory extension id 0x3f.
    let bytes = [0x06 | 0x80, 0x40 | 0x3f, 0x01, 0xaa];
    let mut r = Reader::new(&bytes);
    assert_eq!(
        TransportMessage::decode(&mut r),
        Err(ProtoError::MandatoryExtension(0x3f))
    );
}

#[test]
fn unknown_optional_extension_skipped() {
    let bytes = [0x06 | 0x80, 0x3f, 0x01, 0xaa];
    let mut r = Reader::new(&bytes);
    assert_eq!(
        TransportMessage::decode(&mut r).unwrap(),
        TransportMessage::KeepAlive
    );
    assert!(r.is_empty());
}

#[test]
fn truncated_input_is_malformed() {
    let zid = ZId::new(&[1; 16]).unwrap();
    let mut w = Writer::unbounded();
    TransportMessage::Hello {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Peer,
        zid,
        locators: vec!["tcp/a:1".into()],
    }
    .encode(&mut w)
    .unwrap();
    let bytes = w.into_vec();
    for cut in 1..bytes.len() {
        let mut r = Reader::new(&bytes[..cut]);
        assert!(TransportMessage::decode(&mut r).is_err(), "cut at {cut}");
    }
}
