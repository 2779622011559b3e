use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_proto::core::{Encoding, Priority, Reliability, WhatAmI, WireExpr, ZId};
use tern_proto::network::PushBody;
use tern_proto::transport::{close_reason, TransportMessage};
use tern_proto::zint::{Reader, Writer};
use tern_proto::{NetworkMessage, PROTOCOL_VERSION};
use tern_transport::link::{read_batch, write_batch, MemHub};
use tern_transport::unicast::{FsmEvent, UnicastConfig, UnicastFsm, UnicastTransport};
use tern_transport::{
    PeerId, SystemTimeProvider, TransportError, TransportEventHandler, RX_BUFFER_SIZE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn encode(msg: &TransportMessage) -> Vec<u8> {
    let mut w = Writer::unbounded();
    msg.encode(&mut w).unwrap();
    w.into_vec()
}

fn decode_one(batch: &[u8]) -> TransportMessage {
    let mut r = Reader::new(batch);
    let msg = TransportMessage::decode(&mut r).unwrap();
    assert!(r.is_empty());
    msg
}

fn push_msg(key: &str, payload: &[u8]) -> NetworkMessage {
    NetworkMessage::Push {
        wire_expr: WireExpr::from_str(key).to_owned(),
        qos: Priority::default(),
        body: PushBody::Put {
            timestamp: None,
            encoding: Encoding::default(),
            payload: payload.to_vec(),
            attachment: None,
        },
    }
}

/// Drive the client FSM through the handshake by playing the router side.
fn establish(fsm: &mut UnicastFsm, router_zid: ZId, now: Instant) {
    let events = fsm.start().unwrap();
    let init_syn = match &events[..] {
        [FsmEvent::Send(batch)] => decode_one(batch),
        other => panic!("expected one send, got {other:?}"),
    };
    let (sn_bits, batch_size) = match init_syn {
        TransportMessage::InitSyn {
            version,
            whatami,
            sn_bits,
            batch_size,
            ..
        } => {
            assert_eq!(version, PROTOCOL_VERSION);
            assert_eq!(whatami, WhatAmI::Client);
            (sn_bits, batch_size)
        }
        other => panic!("expected InitSyn, got {other:?}"),
    };

    let init_ack = encode(&TransportMessage::InitAck {
        version: PROTOCOL_VERSION,
        whatami: WhatAmI::Router,
        zid: router_zid,
        sn_bits: sn_bits.min(20),
        batch_size: batch_size.min(1024),
        cookie: vec![0xc0; 8],
    });
    let events = fsm.handle_batch(&init_ack, now).unwrap();
    let open_syn = match &events[..] {
        [FsmEvent::Send(batch)] => decode_one(batch),
        other => panic!("expected OpenSyn send, got {other:?}"),
    };
    match open_syn {
        TransportMessage::OpenSyn { cookie, .. } => assert_eq!(cookie, vec![0xc0; 8]),
        other => panic!("expected OpenSyn, got {other:?}"),
    }

    let open_ack = encode(&TransportMessage::OpenAck {
        lease_ms: 10_000,
        initial_sn: 0,
    });
    let events = fsm.handle_batch(&open_ack, now).unwrap();
    match &events[..] {
        [FsmEvent::Established { router, lease_ms }] => {
            assert_eq!(*router, router_zid);
            assert_eq!(*lease_ms, 10_000);
        }
        other => panic!("expected Established, got {other:?}"),
    }
    assert!(fsm.is_established());
}

#[test]
fn handshake_negotiates_minimum() {
    init_tracing();
    let now = Instant::now();
    let router_zid = ZId::new(&[9; 16]).unwrap();
    let mut fsm = UnicastFsm::new(UnicastConfig::default(), 0, now);
    establish(&mut fsm, router_zid, now);
    // The router proposed 1024; the smaller side wins.
    assert_eq!(fsm.batch_size(), 1024);
    assert_eq!(fsm.router(), Some(router_zid));
}

#[test]
fn reliable_tx_sequence_is_gapless() {
    init_tracing();
    let now = Instant::now();
    let mut fsm = UnicastFsm::new(UnicastConfig::default(), 0, now);
    establish(&mut fsm, ZId::new(&[9; 16]).unwrap(), now);

    for expected_sn in 0u64..5 {
        let events = fsm
            .send_network(&push_msg("demo/seq", b"x"), Reliability::Reliable)
            .unwrap();
        let batch = match &events[..] {
            [FsmEvent::Send(batch)] => batch,
            other => panic!("expected one send, got {other:?}"),
        };
        match decode_one(batch) {
            TransportMessage::Frame { reliable, sn, .. } => {
                assert!(reliable);
                assert_eq!(sn, expected_sn);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }
}

#[test]
fn reliable_rx_rejects_gaps_and_accepts_in_order() {
    init_tracing();
    let now = Instant::now();
    let mut fsm = UnicastFsm::new(UnicastConfig::default(), 0, now);
    establish(&mut fsm, ZId::new(&[9; 16]).unwrap(), now);

    // In-order: sn 0 then 1.
    for sn in 0u64..2 {
        let frame = encode(&TransportMessage::Frame {
            reliable: true,
            sn,
            payload: vec![push_msg("demo/a", b"1")],
        });
        let events = fsm.handle_batch(&frame, now).unwrap();
        assert!(matches!(&events[..], [FsmEvent::Deliver(_)]));
    }

    // A gap on the reliable channel is a protocol violation.
    let frame = encode(&TransportMessage::Frame {
        reliable: true,
        sn: 7,
        payload: vec![push_msg("demo/a", b"2")],
    });
    assert!(matches!(
        fsm.handle_batch(&frame, now),
        Err(TransportError::Protocol(_))
    ));
}

#[test]
fn best_effort_rx_skips_stale_and_advances() {
    init_tracing();
    let now = Instant::now();
    let mut fsm = UnicastFsm::new(UnicastConfig::default(), 0, now);
    establish(&mut fsm, ZId::new(&[9; 16]).unwrap(), now);

    let mk = |sn| {
        encode(&TransportMessage::Frame {
            reliable: false,
            sn,
            payload: vec![push_msg("demo/b", b"x")],
        })
    };
    // Ahead with a gap: accepted.
    let events = fsm.handle_batch(&mk(3), now).unwrap();
    assert!(matches!(&events[..], [FsmEvent::Deliver(_)]));
    // Duplicate / stale: silently dropped.
    let events = fsm.handle_batch(&mk(3), now).unwrap();
    assert!(events.is_empty());
    let events = fsm.handle_batch(&mk(1), now).unwrap();
    assert!(events.is_empty());
    // Next in order: accepted.
    let events = fsm.handle_batch(&mk(4), now).unwrap();
    assert!(matches!(&events[..], [FsmEvent::Deliver(_)]));
}

#[test]
fn keepalive_sent_when_idle_and_lease_expires() {
    init_tracing();
    let t0 = Instant::now();
    let cfg = UnicastConfig {
        lease_ms: 10_000,
        ..Default::default()
    };
    let mut fsm = UnicastFsm::new(cfg, 0, t0);
    establish(&mut fsm, ZId::new(&[9; 16]).unwrap(), t0);

    // Idle tick inside the lease: a KeepAlive goes out.
    let events = fsm.keepalive_tick(t0 + Duration::from_millis(2_857)).unwrap();
    match &events[..] {
        [FsmEvent::Send(batch)] => {
            assert!(matches!(decode_one(batch), TransportMessage::KeepAlive))
        }
        other => panic!("expected keepalive, got {other:?}"),
    }

    // After sending something ourselves, the next tick stays quiet.
    fsm.send_network(&push_msg("demo/k", b"x"), Reliability::Reliable)
        .unwrap();
    let events = fsm.keepalive_tick(t0 + Duration::from_millis(5_714)).unwrap();
    assert!(events.is_empty());

    // A full lease of silence fails the session exactly once.
    let events = fsm.keepalive_tick(t0 + Duration::from_millis(10_001)).unwrap();
    match &events[..] {
        [FsmEvent::Closed { reason }] => assert_eq!(reason.0, close_reason::EXPIRED),
        other => panic!("expected Closed, got {other:?}"),
    }
    assert!(!fsm.is_established());
}

#[test]
fn retransmission_queue_bounds_and_drains() {
    init_tracing();
    let now = Instant::now();
    let mut fsm = UnicastFsm::new(UnicastConfig::default(), 0, now);
    establish(&mut fsm, ZId::new(&[9; 16]).unwrap(), now);

    // Fill the retained-message queue without any reverse traffic.
    for _ in 0..64 {
        fsm.send_network(&push_msg("demo/q", b"x"), Reliability::Reliable)
            .unwrap();
    }
    assert!(matches!(
        fsm.send_network(&push_msg("demo/q", b"x"), Reliability::Reliable),
        Err(TransportError::QueueFull)
    ));

    // Any in-order reliable reception is the implicit cumulative ack.
    let frame = encode(&TransportMessage::Frame {
        reliable: true,
        sn: 0,
        payload: vec![],
    });
    fsm.handle_batch(&frame, now).unwrap();
    fsm.send_network(&push_msg("demo/q", b"x"), Reliability::Reliable)
        .unwrap();
    assert_eq!(fsm.take_unacked().len(), 1);
}

/// Minimal router side for driver tests: answers the handshake, then
/// echoes every reliable Frame payload back on its own SN sequence.
fn spawn_mock_router(link: Arc<tern_transport::MemLink>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let zid = ZId::new(&[0xee; 16]).unwrap();
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        let mut sn_tx = 0u64;
        loop {
            let Ok((n, _)) = read_batch(&*link, &mut buf) else {
                return;
            };
            let mut r = Reader::new(&buf[..n]);
            while !r.is_empty() {
                let Ok(msg) = TransportMessage::decode(&mut r) else {
                    return;
                };
                match msg {
                    TransportMessage::InitSyn {
                        sn_bits,
                        batch_size,
                        ..
                    } => {
                        let ack = TransportMessage::InitAck {
                            version: PROTOCOL_VERSION,
                            whatami: WhatAmI::Router,
                            zid,
                            sn_bits,
                            batch_size,
                            cookie: vec![1, 2, 3],
                        };
                        write_batch(&*link, &encode(&ack)).unwrap();
                    }
                    TransportMessage::OpenSyn { lease_ms, .. } => {
                        let ack = TransportMessage::OpenAck {
                            lease_ms,
                            initial_sn: 0,
                        };
                        write_batch(&*link, &encode(&ack)).unwrap();
                    }
                    TransportMessage::Frame {
                        reliable: true,
                        payload,
                        ..
                    } => {
                        let frame = TransportMessage::Frame {
                            reliable: true,
                            sn: sn_tx,
                            payload,
                        };
                        sn_tx += 1;
                        write_batch(&*link, &encode(&frame)).unwrap();
                    }
                    TransportMessage::Close { .. } => return,
                    _ => {}
                }
            }
        }
    })
}

#[derive(Default)]
struct CountingHandler {
    messages: Mutex<Vec<NetworkMessage>>,
    failed: AtomicUsize,
}

impl TransportEventHandler for CountingHandler {
    fn handle_message(&self, msg: NetworkMessage, _peer: Option<PeerId>) {
        self.messages.lock().push(msg);
    }
    fn peer_joined(&self, _: PeerId, _: ZId) {}
    fn peer_left(&self, _: PeerId, _: ZId) {}
    fn transport_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
    fn lease_tick(&self, _: Instant) {}
}

#[test]
fn driver_roundtrip_over_memory_link() {
    init_tracing();
    let (client_link, router_link) = MemHub::pair();
    let router = spawn_mock_router(router_link);

    let transport = UnicastTransport::open(
        client_link,
        UnicastConfig::default(),
        Arc::new(SystemTimeProvider),
        Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(transport.router_zid(), ZId::new(&[0xee; 16]).unwrap());

    let handler = Arc::new(CountingHandler::default());
    let weak: std::sync::Weak<dyn TransportEventHandler> =
        Arc::downgrade(&(Arc::clone(&handler) as Arc<dyn TransportEventHandler>));
    transport.set_handler(weak);
    Arc::clone(&transport).start_tasks().unwrap();

    let msg = push_msg("demo/example/a", b"hello");
    transport.send_network(&msg, Reliability::Reliable).unwrap();

    // The mock router echoes the frame back to us.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if !handler.messages.lock().is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "no echo before deadline");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(handler.messages.lock()[0], msg);
    assert_eq!(handler.failed.load(Ordering::SeqCst), 0);

    transport.close();
    router.join().unwrap();
}
