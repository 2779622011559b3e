//! Unicast client transport: handshake, reliability windows, lease.
//!
//! The state machine is sans-io: it consumes decoded batches plus an
//! explicit `now` and yields events (batches to write, messages to
//! deliver). The [`UnicastTransport`] driver owns the link and the two
//! worker threads and feeds the machine.

use crate::batch::{encode_transport, frame_network, SnSpace};
use crate::defrag::DefragBuffer;
use crate::error::{TransportError, TransportResult};
use crate::link::{read_batch, write_batch, Link};
use crate::time::TimeProvider;
use crate::{keepalive_interval, TransportEventHandler, BATCH_SIZE_DEFAULT, LEASE_DEFAULT_MS, RX_BUFFER_SIZE, SN_BITS_DEFAULT};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tern_proto::core::{Reliability, WhatAmI, ZId};
use tern_proto::transport::{close_reason, Auth, CloseReason, TransportMessage};
use tern_proto::zint::Reader;
use tern_proto::{NetworkMessage, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

/// Retained-but-unacknowledged reliable messages before send refuses.
const RETX_QUEUE_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct UnicastConfig {
    pub zid: ZId,
    pub lease_ms: u64,
    pub sn_bits: u8,
    pub batch_size: u16,
    pub auth: Option<Auth>,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            zid: ZId::random(),
            lease_ms: LEASE_DEFAULT_MS,
            sn_bits: SN_BITS_DEFAULT,
            batch_size: BATCH_SIZE_DEFAULT,
            auth: None,
        }
    }
}

/// What the state machine wants done after digesting input.
#[derive(Debug)]
pub enum FsmEvent {
    /// Write this batch to the link.
    Send(Vec<u8>),
    /// Hand this message to the session layer.
    Deliver(NetworkMessage),
    /// The handshake completed.
    Established { router: ZId, lease_ms: u64 },
    /// The session is over; the driver tears the transport down.
    Closed { reason: CloseReason },
}

pub type FsmEvents = SmallVec<[FsmEvent; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    InitSent,
    OpenSent,
    Established,
    Closed,
}

/// Client-side session state machine.
pub struct UnicastFsm {
    cfg: UnicastConfig,
    stage: Stage,
    router: Option<ZId>,
    sn_space: SnSpace,
    batch_size: u16,
    lease_ms: u64,
    sn_tx_reliable: u64,
    sn_tx_best_effort: u64,
    sn_rx_reliable: u64,
    sn_rx_best_effort: u64,
    defrag_reliable: DefragBuffer,
    defrag_best_effort: DefragBuffer,
    /// Reliable messages not yet implicitly acknowledged, oldest first.
    retx: VecDeque<NetworkMessage>,
    transmitted: bool,
    last_rx: Instant,
}

impl UnicastFsm {
    pub fn new(cfg: UnicastConfig, initial_sn: u64, now: Instant) -> Self {
        let sn_space = SnSpace::new(cfg.sn_bits);
        Self {
            sn_space,
            batch_size: cfg.batch_size,
            lease_ms: cfg.lease_ms,
            sn_tx_reliable: initial_sn,
            sn_tx_best_effort: initial_sn,
            sn_rx_reliable: 0,
            sn_rx_best_effort: 0,
            defrag_reliable: DefragBuffer::new(),
            defrag_best_effort: DefragBuffer::new(),
            retx: VecDeque::new(),
            transmitted: false,
            last_rx: now,
            stage: Stage::InitSent,
            router: None,
            cfg,
        }
    }

    pub fn is_established(&self) -> bool {
        self.stage == Stage::Established
    }

    pub fn router(&self) -> Option<ZId> {
        self.router
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
    }

    pub fn batch_size(&self) -> u16 {
        self.batch_size
    }

    /// The opening InitSyn.
    pub fn start(&mut self) -> TransportResult<FsmEvents> {
        let init = TransportMessage::InitSyn {
            version: PROTOCOL_VERSION,
            whatami: WhatAmI::Client,
            zid: self.cfg.zid,
            sn_bits: self.cfg.sn_bits,
            batch_size: self.cfg.batch_size,
            auth: self.cfg.auth.clone(),
        };
        let mut events = FsmEvents::new();
        events.push(FsmEvent::Send(encode_transport(&init, self.batch_size)?));
        Ok(events)
    }

    /// Digest one received batch.
    pub fn handle_batch(&mut self, bytes: &[u8], now: Instant) -> TransportResult<FsmEvents> {
        self.last_rx = now;
        let mut events = FsmEvents::new();
        let mut r = Reader::new(bytes);
        while !r.is_empty() {
            let msg = TransportMessage::decode(&mut r)?;
            self.handle_msg(msg, &mut events)?;
        }
        Ok(events)
    }

    fn handle_msg(&mut self, msg: TransportMessage, events: &mut FsmEvents) -> TransportResult<()> {
        match (self.stage, msg) {
            (
                Stage::InitSent,
                TransportMessage::InitAck {
                    version,
                    zid,
                    sn_bits,
                    batch_size,
                    cookie,
                    ..
                },
            ) => {
                if version != PROTOCOL_VERSION {
                    return Err(TransportError::Protocol("protocol version mismatch"));
                }
                // The smaller of the two proposals wins on both axes.
                let sn_bits = self.cfg.sn_bits.min(sn_bits);
                self.sn_space = SnSpace::new(sn_bits);
                self.batch_size = self.cfg.batch_size.min(batch_size);
                self.router = Some(zid);
                let open = TransportMessage::OpenSyn {
                    lease_ms: self.cfg.lease_ms,
                    initial_sn: self.sn_tx_reliable,
                    cookie,
                };
                events.push(FsmEvent::Send(encode_transport(&open, self.batch_size)?));
                self.stage = Stage::OpenSent;
                Ok(())
            }
            (
                Stage::OpenSent,
                TransportMessage::OpenAck {
                    lease_ms,
                    initial_sn,
                },
            ) => {
                self.lease_ms = lease_ms;
                self.sn_rx_reliable = initial_sn;
                self.sn_rx_best_effort = initial_sn;
                self.stage = Stage::Established;
                let router = self.router.ok_or(TransportError::Protocol("open without init"))?;
                info!(router = %router, lease_ms, "session established");
                events.push(FsmEvent::Established { router, lease_ms });
                Ok(())
            }
            (_, TransportMessage::Close { reason, .. }) => {
                info!(%reason, "router closed the session");
                self.stage = Stage::Closed;
                events.push(FsmEvent::Closed { reason });
                Ok(())
            }
            (_, TransportMessage::KeepAlive) => Ok(()),
            (
                Stage::Established,
                TransportMessage::Frame {
                    reliable,
                    sn,
                    payload,
                },
            ) => {
                if reliable {
                    if sn != self.sn_rx_reliable {
                        // Out-of-order on a reliable channel is a protocol
                        // violation, not loss.
                        return Err(TransportError::Protocol("reliable sn out of order"));
                    }
                    self.sn_rx_reliable = self.sn_space.next(sn);
                    // In-order reception on the reverse channel is the
                    // cumulative implicit ack.
                    self.retx.clear();
                } else {
                    if sn != self.sn_rx_best_effort
                        && !self.sn_space.precedes(self.sn_rx_best_effort, sn)
                    {
                        debug!(sn, "dropping stale best-effort frame");
                        return Ok(());
                    }
                    self.sn_rx_best_effort = self.sn_space.next(sn);
                }
                for msg in payload {
                    events.push(FsmEvent::Deliver(msg));
                }
                Ok(())
            }
            (
                Stage::Established,
                TransportMessage::Fragment {
                    reliable,
                    more,
                    sn,
                    payload,
                },
            ) => {
                if reliable {
                    if sn != self.sn_rx_reliable {
                        return Err(TransportError::Protocol("reliable fragment sn out of order"));
                    }
                    self.retx.clear();
                    if let Some(msg) = self.defrag_reliable.push(sn, more, &payload)? {
                        self.sn_rx_reliable = self.sn_space.next(sn);
                        events.push(FsmEvent::Deliver(msg));
                    }
                } else {
                    let fresh = self.defrag_best_effort.is_active()
                        || sn == self.sn_rx_best_effort
                        || self.sn_space.precedes(self.sn_rx_best_effort, sn);
                    if !fresh {
                        debug!(sn, "dropping stale best-effort fragment");
                        return Ok(());
                    }
                    match self.defrag_best_effort.push(sn, more, &payload) {
                        Ok(Some(msg)) => {
                            self.sn_rx_best_effort = self.sn_space.next(sn);
                            events.push(FsmEvent::Deliver(msg));
                        }
                        Ok(None) => {}
                        // Best-effort chains abort quietly; loss is legal there.
                        Err(e) => debug!(error = %e, "best-effort fragment chain aborted"),
                    }
                }
                Ok(())
            }
            (_, TransportMessage::Frame { .. } | TransportMessage::Fragment { .. }) => {
                Err(TransportError::Protocol("frame before establishment"))
            }
            (_, TransportMessage::InitAck { .. } | TransportMessage::OpenAck { .. }) => {
                Err(TransportError::Protocol("unexpected handshake message"))
            }
            (_, other) => {
                debug!(?other, "ignoring message on unicast transport");
                Ok(())
            }
        }
    }

    /// Wrap a network message for the wire.
    pub fn send_network(
        &mut self,
        msg: &NetworkMessage,
        reliability: Reliability,
    ) -> TransportResult<FsmEvents> {
        if self.stage != Stage::Established {
            return Err(TransportError::Closed);
        }
        let reliable = reliability == Reliability::Reliable;
        if reliable && self.retx.len() >= RETX_QUEUE_CAP {
            return Err(TransportError::QueueFull);
        }
        let sn = if reliable {
            let sn = self.sn_tx_reliable;
            self.sn_tx_reliable = self.sn_space.next(sn);
            sn
        } else {
            let sn = self.sn_tx_best_effort;
            self.sn_tx_best_effort = self.sn_space.next(sn);
            sn
        };
        let batches = frame_network(msg, reliable, sn, self.batch_size)?;
        if reliable {
            self.retx.push_back(msg.clone());
        }
        self.transmitted = true;
        Ok(batches.into_iter().map(FsmEvent::Send).collect())
    }

    /// Periodic lease bookkeeping: keepalive when idle, expiry when silent.
    pub fn keepalive_tick(&mut self, now: Instant) -> TransportResult<FsmEvents> {
        let mut events = FsmEvents::new();
        if self.stage != Stage::Established {
            return Ok(events);
        }
        if now.duration_since(self.last_rx) >= Duration::from_millis(self.lease_ms) {
            warn!(lease_ms = self.lease_ms, "router lease expired");
            self.stage = Stage::Closed;
            events.push(FsmEvent::Closed {
                reason: CloseReason(close_reason::EXPIRED),
            });
            return Ok(events);
        }
        if !self.transmitted {
            events.push(FsmEvent::Send(encode_transport(
                &TransportMessage::KeepAlive,
                self.batch_size,
            )?));
        }
        self.transmitted = false;
        Ok(events)
    }

    /// The retained reliable messages, for re-send after a reconnect.
    pub fn take_unacked(&mut self) -> Vec<NetworkMessage> {
        self.retx.drain(..).collect()
    }

    pub fn close_batch(&self) -> TransportResult<Vec<u8>> {
        encode_transport(
            &TransportMessage::Close {
                reason: CloseReason(close_reason::GENERIC),
                session: true,
            },
            self.batch_size,
        )
    }
}

/// The unicast driver: owns the link, the state machine and the read and
/// lease threads.
pub struct UnicastTransport {
    link: Arc<dyn Link>,
    fsm: Mutex<UnicastFsm>,
    /// The send-path lock: user threads, the lease task and the read task
    /// all write to the link, and a batch (length prefix plus body on
    /// streamed links) must reach the wire whole, in SN-stamping order.
    send_lock: Mutex<()>,
    handler: Mutex<Weak<dyn TransportEventHandler>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    time: Arc<dyn TimeProvider>,
    router: ZId,
    lease_ms: u64,
}

impl UnicastTransport {
    /// Connect: run the handshake on the caller's thread, bounded by
    /// `open_timeout`.
    pub fn open(
        link: Arc<dyn Link>,
        cfg: UnicastConfig,
        time: Arc<dyn TimeProvider>,
        open_timeout: Duration,
    ) -> TransportResult<Arc<Self>> {
        let now = time.now_instant();
        let initial_sn =
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..1u64 << cfg.sn_bits.clamp(8, 63));
        let mut fsm = UnicastFsm::new(cfg, initial_sn, now);
        link.set_read_timeout(Some(open_timeout))?;
        for event in fsm.start()? {
            if let FsmEvent::Send(batch) = event {
                write_batch(&*link, &batch)?;
            }
        }
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        let deadline = now + open_timeout;
        let mut established = None;
        'handshake: while established.is_none() {
            if time.now_instant() >= deadline {
                return Err(TransportError::Timeout);
            }
            let (n, _) = read_batch(&*link, &mut buf)?;
            for event in fsm.handle_batch(&buf[..n], time.now_instant())? {
                match event {
                    FsmEvent::Send(batch) => write_batch(&*link, &batch)?,
                    FsmEvent::Established { router, lease_ms } => {
                        established = Some((router, lease_ms));
                        continue 'handshake;
                    }
                    FsmEvent::Closed { .. } => return Err(TransportError::Closed),
                    FsmEvent::Deliver(_) => {}
                }
            }
        }
        link.set_read_timeout(None)?;
        let (router, lease_ms) = established.ok_or(TransportError::Closed)?;
        Ok(Arc::new(Self {
            link,
            fsm: Mutex::new(fsm),
            send_lock: Mutex::new(()),
            handler: Mutex::new(empty_handler()),
            running: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
            time,
            router,
            lease_ms,
        }))
    }

    pub fn router_zid(&self) -> ZId {
        self.router
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
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

    /// Spawn the read and lease tasks.
    pub fn start_tasks(self: Arc<Self>) -> TransportResult<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        let read_me = Arc::clone(&self);
        let read = std::thread::Builder::new()
            .name("tern-uni-read".into())
            .spawn(move || read_me.read_task())
            .map_err(|_| TransportError::System("spawning read task"))?;
        let lease_me = Arc::clone(&self);
        let lease = std::thread::Builder::new()
            .name("tern-uni-lease".into())
            .spawn(move || lease_me.lease_task())
            .map_err(|_| TransportError::System("spawning lease task"))?;
        tasks.push(read);
        tasks.push(lease);
        Ok(())
    }

    fn read_task(self: Arc<Self>) {
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        while self.running.load(Ordering::Acquire) {
            let (n, _) = match read_batch(&*self.link, &mut buf) {
                Ok(out) => out,
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!(error = %e, "link read failed");
                        self.fail();
                    }
                    return;
                }
            };
            let now = self.time.now_instant();
            let events = {
                let mut fsm = self.fsm.lock();
                match fsm.handle_batch(&buf[..n], now) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "protocol error, closing transport");
                        drop(fsm);
                        self.fail();
                        return;
                    }
                }
            };
            if !self.dispatch(events) {
                return;
            }
        }
    }

    fn lease_task(self: Arc<Self>) {
        let interval = keepalive_interval(Duration::from_millis(self.lease_ms));
        while self.running.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let now = self.time.now_instant();
            let events = {
                let mut fsm = self.fsm.lock();
                match fsm.keepalive_tick(now) {
                    Ok(events) => events,
                    Err(_) => return,
                }
            };
            if !self.dispatch(events) {
                return;
            }
            if let Some(handler) = self.handler() {
                handler.lease_tick(now);
            }
        }
    }

    /// Apply events with no lock held. Returns false when the transport
    /// died along the way.
    fn dispatch(&self, events: FsmEvents) -> bool {
        for event in events {
            match event {
                FsmEvent::Send(batch) => {
                    let _send = self.send_lock.lock();
                    if let Err(e) = write_batch(&*self.link, &batch) {
                        warn!(error = %e, "link write failed");
                        self.fail();
                        return false;
                    }
                }
                FsmEvent::Deliver(msg) => {
                    if let Some(handler) = self.handler() {
                        handler.handle_message(msg, None);
                    }
                }
                FsmEvent::Closed { .. } => {
                    self.fail();
                    return false;
                }
                FsmEvent::Established { .. } => {}
            }
        }
        true
    }

    pub fn send_network(
        &self,
        msg: &NetworkMessage,
        reliability: Reliability,
    ) -> TransportResult<()> {
        // Held across stamping and the writes: frames reach the wire in
        // the order their SNs were issued.
        let _send = self.send_lock.lock();
        let events = self.fsm.lock().send_network(msg, reliability)?;
        for event in events {
            if let FsmEvent::Send(batch) = event {
                write_batch(&*self.link, &batch)?;
            }
        }
        Ok(())
    }

    /// Reliable messages never implicitly acknowledged, for reopen.
    pub fn take_unacked(&self) -> Vec<NetworkMessage> {
        self.fsm.lock().take_unacked()
    }

    fn fail(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.link.close();
            if let Some(handler) = self.handler() {
                handler.transport_failed();
            }
        }
    }

    /// Orderly close: notify the router, stop the tasks, close the link.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _send = self.send_lock.lock();
            if let Ok(batch) = self.fsm.lock().close_batch() {
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

/// Placeholder for the handler slot before the session registers itself.
struct DummyHandler;

impl TransportEventHandler for DummyHandler {
    fn handle_message(&self, _: NetworkMessage, _: Option<crate::PeerId>) {}
    fn peer_joined(&self, _: crate::PeerId, _: ZId) {}
    fn peer_left(&self, _: crate::PeerId, _: ZId) {}
    fn transport_failed(&self) {}
    fn lease_tick(&self, _: Instant) {}
}

pub(crate) fn empty_handler() -> Weak<dyn TransportEventHandler> {
    Weak::<DummyHandler>::new()
}
