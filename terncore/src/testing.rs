//! In-memory session fixtures for tests: peer sessions joined through a
//! lossless broadcast hub, no sockets involved.

use crate::config::{Config, Mode, LEASE_KEY, MODE_KEY};
use crate::error::TernResult;
use crate::session::{SessionInner, TransportHandle};
use crate::Session;
use std::sync::Arc;
use tern_proto::core::ZId;
use tern_transport::multicast::{MulticastConfig, MulticastTransport};
use tern_transport::{MemHub, SystemTimeProvider, TimeProvider};

/// A peer session attached to `hub`, with a short Join interval so tests
/// discover quickly.
pub fn peer_session_on(hub: &MemHub, lease_ms: u64) -> TernResult<Session> {
    peer_session_on_time(hub, lease_ms, Arc::new(SystemTimeProvider))
}

/// Same, with an injected clock: timestamps the session stamps on data and
/// replies come from `time`, so tests can order them deterministically.
pub fn peer_session_on_time(
    hub: &MemHub,
    lease_ms: u64,
    time: Arc<dyn TimeProvider>,
) -> TernResult<Session> {
    let mut config = Config::new();
    config.insert(MODE_KEY, "peer")?;
    config.insert(LEASE_KEY, &lease_ms.to_string())?;
    let zid = ZId::random();
    let transport = MulticastTransport::open(
        hub.attach(),
        MulticastConfig {
            zid,
            lease_ms,
            join_interval_ms: 50,
            ..Default::default()
        },
        Arc::clone(&time),
    )?;
    let inner = SessionInner::new(
        zid,
        Mode::Peer,
        config,
        TransportHandle::Multicast(transport),
        time,
        None,
    );
    inner.start_tasks()?;
    Ok(Session::from_inner(inner))
}

/// Two peer sessions on a fresh hub, mutually discovered once their Joins
/// cross (tens of milliseconds).
pub fn peer_session_pair(lease_ms: u64) -> TernResult<(Session, Session)> {
    let hub = MemHub::new();
    let a = peer_session_on(&hub, lease_ms)?;
    let b = peer_session_on(&hub, lease_ms)?;
    Ok((a, b))
}
