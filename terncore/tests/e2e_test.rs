//! Two-node scenarios over the in-memory broadcast hub.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_transport::{ManualTimeProvider, MemHub};
use terncore::testing::{peer_session_on, peer_session_on_time, peer_session_pair};
use terncore::{ConsolidationMode, GetOptions, Reply, Sample, SampleKind, Session};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Block until `to` hears `from` (peer discovery plus one delivered put).
fn wait_linked(from: &Session, to: &Session) {
    let heard = Arc::new(AtomicUsize::new(0));
    let heard_cb = heard.clone();
    let sub = to
        .declare_subscriber("linkcheck/ping", move |_| {
            heard_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("declare linkcheck subscriber");
    let deadline = Instant::now() + Duration::from_secs(5);
    while heard.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "peers never linked");
        from.put("linkcheck/ping", b"").expect("linkcheck put");
        std::thread::sleep(Duration::from_millis(20));
    }
    drop(sub);
}

fn linked_pair() -> (Session, Session) {
    let (a, b) = peer_session_pair(10_000).expect("session pair");
    wait_linked(&a, &b);
    wait_linked(&b, &a);
    (a, b)
}

#[test]
fn subscriber_receives_matching_put_exactly_once() {
    init_tracing();
    let (a, b) = linked_pair();

    let samples: Arc<Mutex<Vec<Sample>>> = Arc::new(Mutex::new(Vec::new()));
    let samples_cb = samples.clone();
    let sub = a
        .declare_subscriber("demo/example/**", move |sample| {
            samples_cb.lock().push(sample);
        })
        .unwrap();

    b.put("demo/example/a", b"hello").unwrap();
    // An unrelated key must not match.
    b.put("demo/other", b"nope").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while samples.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Settle: a duplicate would arrive shortly after.
    std::thread::sleep(Duration::from_millis(200));

    let got = samples.lock();
    assert_eq!(got.len(), 1, "exactly one delivery");
    assert_eq!(got[0].keyexpr, "demo/example/a");
    assert_eq!(got[0].payload, b"hello");
    assert_eq!(got[0].kind, SampleKind::Put);
    drop(got);

    // Undeclared subscribers hear nothing more.
    drop(sub);
    std::thread::sleep(Duration::from_millis(50));
    b.put("demo/example/a", b"again").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(samples.lock().len(), 1);
}

#[test]
fn delete_reaches_subscribers_as_tombstone() {
    init_tracing();
    let (a, b) = linked_pair();

    let kinds: Arc<Mutex<Vec<SampleKind>>> = Arc::new(Mutex::new(Vec::new()));
    let kinds_cb = kinds.clone();
    let _sub = a
        .declare_subscriber("demo/del/**", move |sample| {
            kinds_cb.lock().push(sample.kind);
        })
        .unwrap();

    b.put("demo/del/x", b"v").unwrap();
    b.delete("demo/del/x").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while kinds.lock().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*kinds.lock(), vec![SampleKind::Put, SampleKind::Delete]);
}

#[test]
fn queryable_serves_get_and_final_unblocks() {
    init_tracing();
    let (a, b) = linked_pair();

    let _qbl = b
        .declare_queryable("demo/**", true, |query| {
            assert_eq!(query.keyexpr(), "demo/stats");
            let wants: Vec<_> = query.params().collect();
            assert_eq!(wants, vec![("a", Some("1")), ("bee", Some("string"))]);
            query.reply("demo/stats", b"42").unwrap();
        })
        .unwrap();

    let replies = a
        .get_collect("demo/stats?a=1;bee=string", GetOptions::default())
        .unwrap();
    assert_eq!(replies.len(), 1);
    match &replies[0] {
        Reply::Ok { sample, replier } => {
            assert_eq!(sample.keyexpr, "demo/stats");
            assert_eq!(sample.payload, b"42");
            assert_eq!(*replier, Some(b.zid()));
        }
        other => panic!("expected ok reply, got {other:?}"),
    }
}

#[test]
fn get_with_no_matching_queryable_terminates_empty() {
    init_tracing();
    let (a, _b) = linked_pair();
    let replies = a
        .get_collect(
            "nothing/here",
            GetOptions {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(replies.is_empty());
}

#[test]
fn latest_consolidation_keeps_newest_reply_per_key() {
    init_tracing();
    let hub = MemHub::new();
    let a = peer_session_on(&hub, 10_000).unwrap();
    let clock = Arc::new(ManualTimeProvider::new(Instant::now(), 1_000));
    let b = peer_session_on_time(&hub, 10_000, clock.clone()).unwrap();
    wait_linked(&a, &b);
    wait_linked(&b, &a);

    // One handler answering twice for the same key, the second answer
    // stamped one second later.
    let handler_clock = clock.clone();
    let _qbl = b
        .declare_queryable("demo/**", true, move |query| {
            query.reply("demo/example/a", b"old").unwrap();
            handler_clock.advance(Duration::from_secs(1));
            query.reply("demo/example/a", b"new").unwrap();
        })
        .unwrap();

    let drops = Arc::new(AtomicUsize::new(0));
    let replies: Arc<Mutex<Vec<Reply>>> = Arc::new(Mutex::new(Vec::new()));
    let replies_cb = replies.clone();
    let drops_cb = drops.clone();
    a.get(
        "demo/**",
        GetOptions {
            consolidation: ConsolidationMode::Latest,
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
        move |reply| {
            replies_cb.lock().push(reply);
        },
        move || {
            drops_cb.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while drops.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1, "drop callback fired once");

    let got = replies.lock();
    assert_eq!(got.len(), 1, "only the consolidated reply survives");
    match &got[0] {
        Reply::Ok { sample, .. } => assert_eq!(sample.payload, b"new"),
        other => panic!("expected ok reply, got {other:?}"),
    }
}

#[test]
fn query_deadline_fires_drop_exactly_once() {
    init_tracing();
    let hub = MemHub::new();
    // Alone in the group: nobody will ever answer.
    let a = peer_session_on(&hub, 10_000).unwrap();

    let drops = Arc::new(AtomicUsize::new(0));
    let replies = Arc::new(AtomicUsize::new(0));
    let drops_cb = drops.clone();
    let replies_cb = replies.clone();
    a.get(
        "demo/**",
        GetOptions {
            timeout: Duration::from_millis(150),
            ..Default::default()
        },
        move |_| {
            replies_cb.fetch_add(1, Ordering::SeqCst);
        },
        move || {
            drops_cb.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while drops.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(replies.load(Ordering::SeqCst), 0);
}

#[test]
fn closing_a_session_finalizes_pending_queries() {
    init_tracing();
    let hub = MemHub::new();
    let a = peer_session_on(&hub, 10_000).unwrap();

    let drops = Arc::new(AtomicUsize::new(0));
    let drops_cb = drops.clone();
    a.get(
        "demo/**",
        GetOptions {
            timeout: Duration::from_secs(60),
            ..Default::default()
        },
        |_| {},
        move || {
            drops_cb.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    a.close().unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
