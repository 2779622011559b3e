//! # Tern Transport
//!
//! Links, session establishment and liveness for the tern overlay.
//!
//! ## Architecture
//!
//! - **Links** ([`link`]): TCP, UDP unicast/multicast and an in-memory test
//!   link behind one byte-batch trait.
//! - **Unicast** ([`unicast`]): the InitSyn/InitAck/OpenSyn/OpenAck
//!   handshake, per-reliability sequence windows and the lease/keepalive
//!   loop toward a single router.
//! - **Multicast** ([`multicast`]): Join-based peer discovery with a lease
//!   per discovered peer.
//! - **Scouting** ([`scout`]): router/peer discovery over UDP multicast.
//!
//! Both transports are split into a sans-io state machine (driven with
//! explicit `now` instants, fully testable without sockets) and a driver
//! owning the link plus one read thread and one lease thread.

pub mod batch;
pub mod defrag;
pub mod endpoint;
pub mod error;
pub mod flat_map;
pub mod link;
pub mod multicast;
pub mod scout;
pub mod time;
pub mod unicast;

use std::time::Duration;
use tern_proto::core::ZId;
use tern_proto::NetworkMessage;

pub use batch::SnSpace;
pub use defrag::{DefragBuffer, FRAG_MAX_SIZE};
pub use endpoint::{Endpoint, Protocol};
pub use error::{TransportError, TransportResult};
pub use flat_map::FlatMap;
pub use link::{Link, LinkAddr, LinkCaps, MemHub, MemLink, TcpLink, UdpMulticastLink, UdpUnicastLink};
pub use multicast::{MulticastConfig, MulticastFsm, MulticastTransport};
pub use scout::{scout, HelloInfo};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use unicast::{UnicastConfig, UnicastFsm, UnicastTransport};

/// Default lease granted to and expected from peers.
pub const LEASE_DEFAULT_MS: u64 = 10_000;
/// Interval between multicast Join announcements.
pub const JOIN_INTERVAL_MS: u64 = 2_500;
/// Default maximum batch size proposed during negotiation.
pub const BATCH_SIZE_DEFAULT: u16 = 2_048;
/// Default sequence-number ring width proposed during negotiation.
pub const SN_BITS_DEFAULT: u8 = 28;
/// Default scouting period.
pub const SCOUT_TIMEOUT_DEFAULT_MS: u64 = 1_000;
/// Receive buffer large enough for any batch a link can deliver.
pub const RX_BUFFER_SIZE: usize = u16::MAX as usize;

/// Keepalives fire every `lease / 3.5` milliseconds, kept in integer
/// arithmetic.
pub fn keepalive_interval_ms(lease_ms: u64) -> u64 {
    (lease_ms * 2 / 7).max(1)
}

pub fn keepalive_interval(lease: Duration) -> Duration {
    Duration::from_millis(keepalive_interval_ms(lease.as_millis() as u64))
}

/// A transport-local handle on a discovered multicast peer. Remote resource
/// ids are scoped by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u32);

/// The session layer's view of a transport, registered as a weak reference
/// so the transport never keeps its session alive.
pub trait TransportEventHandler: Send + Sync {
    /// A network message arrived; `peer` identifies the origin on multicast
    /// transports.
    fn handle_message(&self, msg: NetworkMessage, peer: Option<PeerId>);
    fn peer_joined(&self, peer: PeerId, zid: ZId);
    fn peer_left(&self, peer: PeerId, zid: ZId);
    /// The transport failed (lease expiry, link error, remote Close).
    fn transport_failed(&self);
    /// Periodic wakeup from the lease task for deadline bookkeeping.
    fn lease_tick(&self, now: std::time::Instant);
}
