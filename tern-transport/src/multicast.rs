//! Multicast peer transport: Join-based discovery and per-peer leases.
//!
//! There is no handshake. Participation starts by sending periodic Join
//! announcements; a Join from an unknown origin inserts a peer record with
//! its advertised lease. The lease task wakes on the minimum of the next
//! peer deadline, the next keepalive and the next Join, and drops peers
//! that stayed silent for a whole lease.

use crate::batch::{encode_transport, frame_network, SnSpace};
use crate::defrag::DefragBuffer;
use crate::error::{TransportError, TransportResult};
use crate::flat_map::FlatMap;
use crate::link::{read_batch, write_batch, Link, LinkAddr};
use crate::time::TimeProvider;
use crate::unicast::empty_handler;
use crate::{
    keepalive_interval_ms, PeerId, TransportEventHandler, BATCH_SIZE_DEFAULT, JOIN_INTERVAL_MS,
    LEASE_DEFAULT_MS, RX_BUFFER_SIZE, SN_BITS_DEFAULT,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tern_proto::core::{Reliability, WhatAmI, ZId};
use tern_proto::transport::{ConduitSn, TransportMessage};
use tern_proto::zint::Reader;
use tern_proto::{NetworkMessage, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub zid: ZId,
    pub lease_ms: u64,
    pub sn_bits: u8,
    pub batch_size: u16,
    pub join_interval_ms: u64,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            zid: ZId::random(),
            lease_ms: LEASE_DEFAULT_MS,
            sn_bits: SN_BITS_DEFAULT,
            batch_size: BATCH_SIZE_DEFAULT,
            join_interval_ms: JOIN_INTERVAL_MS,
        }
    }
}

#[derive(Debug)]
struct Peer {
    id: PeerId,
    zid: ZId,
    lease_ms: u64,
    /// Milliseconds left before the lease check; always within
    /// `[0, lease_ms]`.
    next_lease_ms: i64,
    received: bool,
    sn_rx_reliable: u64,
    sn_rx_best_effort: u64,
    defrag_reliable: DefragBuffer,
    defrag_best_effort: DefragBuffer,
}

/// Events the driver applies after each state-machine call.
#[derive(Debug)]
pub enum McastEvent {
    Send(Vec<u8>),
    Deliver(NetworkMessage, PeerId),
    PeerJoined(PeerId, ZId),
    PeerLeft(PeerId, ZId),
}

pub type McastEvents = SmallVec<[McastEvent; 4]>;

/// Sans-io state for one multicast group.
pub struct MulticastFsm {
    cfg: MulticastConfig,
    sn_space: SnSpace,
    sn_tx: ConduitSn,
    peers: FlatMap<LinkAddr, Peer>,
    next_peer_id: u32,
    transmitted: bool,
}

impl MulticastFsm {
    pub fn new(cfg: MulticastConfig, initial_sn: u64) -> Self {
        Self {
            sn_space: SnSpace::new(cfg.sn_bits),
            sn_tx: ConduitSn {
                reliable: initial_sn,
                best_effort: initial_sn,
            },
            peers: FlatMap::new(),
            next_peer_id: 0,
            transmitted: false,
            cfg,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_zids(&self) -> Vec<ZId> {
        self.peers.values().map(|p| p.zid).collect()
    }

    /// The periodic Join announcing our liveness and SN state.
    pub fn join_batch(&mut self) -> TransportResult<Vec<u8>> {
        let join = TransportMessage::Join {
            version: PROTOCOL_VERSION,
            whatami: WhatAmI::Peer,
            zid: self.cfg.zid,
            lease_ms: self.cfg.lease_ms,
            next_sn: self.sn_tx,
        };
        self.transmitted = true;
        encode_transport(&join, self.cfg.batch_size)
    }

    pub fn keepalive_batch(&self) -> TransportResult<Vec<u8>> {
        encode_transport(&TransportMessage::KeepAlive, self.cfg.batch_size)
    }

    /// Clear and return the transmitted-since-last-check flag.
    pub fn take_transmitted(&mut self) -> bool {
        std::mem::take(&mut self.transmitted)
    }

    pub fn handle_batch(&mut self, bytes: &[u8], addr: LinkAddr) -> TransportResult<McastEvents> {
        let mut events = McastEvents::new();
        let mut r = Reader::new(bytes);
        while !r.is_empty() {
            let msg = TransportMessage::decode(&mut r)?;
            self.handle_msg(msg, &addr, &mut events)?;
        }
        Ok(events)
    }

    fn handle_msg(
        &mut self,
        msg: TransportMessage,
        addr: &LinkAddr,
        events: &mut McastEvents,
    ) -> TransportResult<()> {
        match msg {
            TransportMessage::Join {
                zid,
                lease_ms,
                next_sn,
                whatami,
                ..
            } => {
                if zid == self.cfg.zid {
                    // Our own announcement looped back.
                    return Ok(());
                }
                if let Some(peer) = self.peers.get_mut(addr) {
                    peer.received = true;
                    peer.lease_ms = lease_ms;
                    return Ok(());
                }
                let id = PeerId(self.next_peer_id);
                self.next_peer_id += 1;
                info!(peer = %zid, %whatami, lease_ms, "new peer joined the group");
                self.peers.insert(
                    addr.clone(),
                    Peer {
                        id,
                        zid,
                        lease_ms,
                        next_lease_ms: lease_ms as i64,
                        received: true,
                        sn_rx_reliable: next_sn.reliable,
                        sn_rx_best_effort: next_sn.best_effort,
                        defrag_reliable: DefragBuffer::new(),
                        defrag_best_effort: DefragBuffer::new(),
                    },
                );
                events.push(McastEvent::PeerJoined(id, zid));
                Ok(())
            }
            TransportMessage::KeepAlive => {
                if let Some(peer) = self.peers.get_mut(addr) {
                    peer.received = true;
                }
                Ok(())
            }
            TransportMessage::Close { .. } => {
                if let Some(peer) = self.peers.remove(addr) {
                    info!(peer = %peer.zid, "peer left the group");
                    events.push(McastEvent::PeerLeft(peer.id, peer.zid));
                }
                Ok(())
            }
            TransportMessage::Frame {
                reliable,
                sn,
                payload,
            } => {
                let sn_space = self.sn_space;
                let Some(peer) = self.peers.get_mut(addr) else {
                    debug!(%addr, "frame from unknown peer dropped");
                    return Ok(());
                };
                peer.received = true;
                let expected = if reliable {
                    &mut peer.sn_rx_reliable
                } else {
                    &mut peer.sn_rx_best_effort
                };
                if sn != *expected && !sn_space.precedes(*expected, sn) {
                    debug!(peer = %peer.zid, sn, "dropping duplicate frame");
                    return Ok(());
                }
                *expected = sn_space.next(sn);
                let id = peer.id;
                for msg in payload {
                    events.push(McastEvent::Deliver(msg, id));
                }
                Ok(())
            }
            TransportMessage::Fragment {
                reliable,
                more,
                sn,
                payload,
            } => {
                let sn_space = self.sn_space;
                let Some(peer) = self.peers.get_mut(addr) else {
                    debug!(%addr, "fragment from unknown peer dropped");
                    return Ok(());
                };
                peer.received = true;
                let (expected, defrag) = if reliable {
                    (&mut peer.sn_rx_reliable, &mut peer.defrag_reliable)
                } else {
                    (&mut peer.sn_rx_best_effort, &mut peer.defrag_best_effort)
                };
                let fresh =
                    defrag.is_active() || sn == *expected || sn_space.precedes(*expected, sn);
                if !fresh {
                    debug!(peer = %peer.zid, sn, "dropping duplicate fragment");
                    return Ok(());
                }
                match defrag.push(sn, more, &payload) {
                    Ok(Some(msg)) => {
                        *expected = sn_space.next(sn);
                        let id = peer.id;
                        events.push(McastEvent::Deliver(msg, id));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // The chain is lost but the group lives on.
                        warn!(peer = %peer.zid, error = %e, "fragment chain aborted");
                    }
                }
                Ok(())
            }
            other => {
                debug!(?other, "ignoring message on multicast transport");
                Ok(())
            }
        }
    }

    pub fn send_network(
        &mut self,
        msg: &NetworkMessage,
        reliability: Reliability,
    ) -> TransportResult<McastEvents> {
        let reliable = reliability == Reliability::Reliable;
        let sn = if reliable {
            let sn = self.sn_tx.reliable;
            self.sn_tx.reliable = self.sn_space.next(sn);
            sn
        } else {
            let sn = self.sn_tx.best_effort;
            self.sn_tx.best_effort = self.sn_space.next(sn);
            sn
        };
        let batches = frame_network(msg, reliable, sn, self.cfg.batch_size)?;
        self.transmitted = true;
        Ok(batches.into_iter().map(McastEvent::Send).collect())
    }

    /// Subtract a slept interval from every peer's remaining lease.
    pub fn elapse(&mut self, interval_ms: u64) {
        for peer in self.peers.values_mut() {
            peer.next_lease_ms = (peer.next_lease_ms - interval_ms as i64).max(0);
        }
    }

    /// Drop peers whose lease ran out without any reception; rearm the
    /// rest.
    pub fn expire_peers(&mut self) -> McastEvents {
        let mut events = McastEvents::new();
        self.peers.retain(|_, peer| {
            if peer.next_lease_ms > 0 {
                return true;
            }
            if peer.received {
                peer.received = false;
                peer.next_lease_ms = peer.lease_ms as i64;
                return true;
            }
            info!(peer = %peer.zid, lease_ms = peer.lease_ms, "peer lease expired");
            events.push(McastEvent::PeerLeft(peer.id, peer.zid));
            false
        });
        events
    }

    /// Milliseconds until the earliest peer lease deadline; the local lease
    /// when the group is empty.
    pub fn next_lease_ms(&self) -> u64 {
        self.peers
            .values()
            .map(|p| p.next_lease_ms.max(0) as u64)
            .min()
            .unwrap_or(self.cfg.lease_ms)
    }

    /// The smallest advertised lease in the group, bounded by ours.
    pub fn min_lease_ms(&self) -> u64 {
        self.peers
            .values()
            .map(|p| p.lease_ms)
            .min()
            .unwrap_or(self.cfg.lease_ms)
            .min(self.cfg.lease_ms)
    }
}

/// Driver for one multicast group link.
pub struct MulticastTransport {
    link: Arc<dyn Link>,
    fsm: Mutex<MulticastFsm>,
    /// The send-path lock: user threads and the lease task both write to
    /// the link, and a batch must reach the wire whole, in SN-stamping
    /// order.
    send_lock: Mutex<()>,
    handler: Mutex<Weak<dyn TransportEventHandler>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    time: Arc<dyn TimeProvider>,
    join_interval_ms: u64,
}

impl MulticastTransport {
    pub fn open(
        link: Arc<dyn Link>,
        cfg: MulticastConfig,
        time: Arc<dyn TimeProvider>,
    ) -> TransportResult<Arc<Self>> {
        let initial_sn =
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..1u64 << cfg.sn_bits.clamp(8, 63));
        let join_interval_ms = cfg.join_interval_ms;
        let mut fsm = MulticastFsm::new(cfg, initial_sn);
        // Announce ourselves right away; the lease task repeats it.
        let join = fsm.join_batch()?;
        write_batch(&*link, &join)?;
        Ok(Arc::new(Self {
            link,
            fsm: Mutex::new(fsm),
            send_lock: Mutex::new(()),
            handler: Mutex::new(empty_handler()),
            running: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
            time,
            join_interval_ms,
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_handler(&self, handler: Weak<dyn TransportEventHandler>) {
        *self.handler.lock() = handler;
    }

    fn handler(&self) -> Option<Arc<dyn TransportEventHandler>> {
        self.handler.lock().upgrade()
    }

    pub fn peer_zids(&self) -> Vec<ZId> {
        self.fsm.lock().peer_zids()
    }

    pub fn start_tasks(self: Arc<Self>) -> TransportResult<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        let read_me = Arc::clone(&self);
        let read = std::thread::Builder::new()
            .name("tern-mc-read".into())
            .spawn(move || read_me.read_task())
            .map_err(|_| TransportError::System("spawning read task"))?;
        let lease_me = Arc::clone(&self);
        let lease = std::thread::Builder::new()
            .name("tern-mc-lease".into())
            .spawn(move || lease_me.lease_task())
            .map_err(|_| TransportError::System("spawning lease task"))?;
        tasks.push(read);
        tasks.push(lease);
        Ok(())
    }

    fn read_task(self: Arc<Self>) {
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        while self.running.load(Ordering::Acquire) {
            let (n, addr) = match read_batch(&*self.link, &mut buf) {
                Ok(out) => out,
                Err(e) => {
                    if self.running.load(Ordering::Acquire) && !e.is_timeout() {
                        warn!(error = %e, "multicast link read failed");
                        self.fail();
                    }
                    if e.is_timeout() {
                        continue;
                    }
                    return;
                }
            };
            let events = {
                let mut fsm = self.fsm.lock();
                match fsm.handle_batch(&buf[..n], addr) {
                    Ok(events) => events,
                    Err(e) => {
                        // A malformed datagram poisons nobody else.
                        debug!(error = %e, "dropping undecodable batch");
                        continue;
                    }
                }
            };
            self.dispatch(events);
        }
    }

    /// The group lease loop: sleep to the earliest deadline among peer
    /// leases, the keepalive counter and the Join counter, then service
    /// whichever elapsed.
    fn lease_task(self: Arc<Self>) {
        let local_lease = self.fsm.lock().min_lease_ms();
        let mut next_lease = self.fsm.lock().next_lease_ms() as i64;
        let mut next_keepalive = keepalive_interval_ms(local_lease) as i64;
        let mut next_join = self.join_interval_ms as i64;
        while self.running.load(Ordering::Acquire) {
            if next_lease <= 0 {
                let events = self.fsm.lock().expire_peers();
                self.dispatch(events);
            }
            if next_join <= 0 {
                let sent = {
                    let _send = self.send_lock.lock();
                    match self.fsm.lock().join_batch() {
                        Ok(batch) => write_batch(&*self.link, &batch),
                        Err(_) => return,
                    }
                };
                if let Err(e) = sent {
                    warn!(error = %e, "sending join failed");
                    self.fail();
                    return;
                }
                next_join = self.join_interval_ms as i64;
            }
            if next_keepalive <= 0 {
                let sent = {
                    let _send = self.send_lock.lock();
                    let (transmitted, batch) = {
                        let mut fsm = self.fsm.lock();
                        (fsm.take_transmitted(), fsm.keepalive_batch())
                    };
                    if transmitted {
                        Ok(())
                    } else {
                        match batch {
                            Ok(batch) => write_batch(&*self.link, &batch),
                            Err(_) => return,
                        }
                    }
                };
                if let Err(e) = sent {
                    warn!(error = %e, "sending keepalive failed");
                    self.fail();
                    return;
                }
                next_keepalive = keepalive_interval_ms(self.fsm.lock().min_lease_ms()) as i64;
            }
            if let Some(handler) = self.handler() {
                handler.lease_tick(self.time.now_instant());
            }
            let mut interval = if next_lease > 0 {
                next_lease.min(next_keepalive).min(next_join)
            } else {
                next_keepalive.min(next_join)
            };
            interval = interval.max(1);
            std::thread::sleep(Duration::from_millis(interval as u64));
            {
                let mut fsm = self.fsm.lock();
                fsm.elapse(interval as u64);
                next_lease = fsm.next_lease_ms() as i64;
            }
            next_keepalive -= interval;
            next_join -= interval;
        }
    }

    fn dispatch(&self, events: McastEvents) {
        let handler = self.handler();
        for event in events {
            match event {
                McastEvent::Send(batch) => {
                    let _send = self.send_lock.lock();
                    if let Err(e) = write_batch(&*self.link, &batch) {
                        warn!(error = %e, "multicast write failed");
                        self.fail();
                        return;
                    }
                }
                McastEvent::Deliver(msg, peer) => {
                    if let Some(handler) = &handler {
                        handler.handle_message(msg, Some(peer));
                    }
                }
                McastEvent::PeerJoined(peer, zid) => {
                    if let Some(handler) = &handler {
                        handler.peer_joined(peer, zid);
                    }
                }
                McastEvent::PeerLeft(peer, zid) => {
                    if let Some(handler) = &handler {
                        handler.peer_left(peer, zid);
                    }
                }
            }
        }
    }

    pub fn send_network(
        &self,
        msg: &NetworkMessage,
        reliability: Reliability,
    ) -> TransportResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        // Held across stamping and the writes: frames reach the wire in
        // the order their SNs were issued.
        let _send = self.send_lock.lock();
        let events = self.fsm.lock().send_network(msg, reliability)?;
        for event in events {
            if let McastEvent::Send(batch) = event {
                write_batch(&*self.link, &batch)?;
            }
        }
        Ok(())
    }

    fn fail(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.link.close();
            if let Some(handler) = self.handler() {
                handler.transport_failed();
            }
        }
    }

    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _send = self.send_lock.lock();
            if let Ok(batch) = encode_transport(
                &TransportMessage::Close {
                    reason: tern_proto::transport::CloseReason(
                        tern_proto::transport::close_reason::GENERIC,
                    ),
                    session: true,
                },
                BATCH_SIZE_DEFAULT,
            ) {
                let _ = write_batch(&*self.link, &batch);
            }
            let _ = self.link.close();
        }
        let mut tasks = self.tasks.lock();
        let current = std::thread::current().id();
        for task in tasks.drain(..) {
            if task.thread().id() != current {
                let _ = task.join();
            }
        }
    }
}
