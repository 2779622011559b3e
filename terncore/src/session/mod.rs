//! Session internals: entity tables, dispatch, query lifecycle and the
//! transport event handler.
//!
//! Lock discipline: the send path lock lives inside each transport; the
//! entity tables and the pending-query registry have one mutex each. No
//! user callback ever runs with a core lock held; dispatch collects the
//! callbacks under the table lock, releases it, then invokes them.

pub mod query;
pub mod resource;

use crate::config::{Config, Mode};
use crate::error::{TernError, TernResult};
use crate::keyexpr;
use crate::types::{GetOptions, PutOptions, Reply, Sample, SampleKind};
use crate::utils::query_params::{query_params, QueryParams};
use parking_lot::Mutex;
use query::{QueryFinish, QueryRegistry};
use resource::ResourceTables;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_proto::core::{Encoding, Priority, Reliability, Timestamp, WireExpr, ZId};
use tern_proto::network::{DeclareBody, PushBody, QueryBody, ReplyBody, RequestBody, ResponseBody};
use tern_proto::NetworkMessage;
use tern_transport::multicast::MulticastTransport;
use tern_transport::unicast::UnicastTransport;
use tern_transport::{PeerId, TimeProvider, TransportEventHandler};
use tracing::{debug, error, info, warn};

/// The one transport a session speaks through.
#[derive(Clone)]
pub(crate) enum TransportHandle {
    Unicast(Arc<UnicastTransport>),
    Multicast(Arc<MulticastTransport>),
}

impl TransportHandle {
    fn send(&self, msg: &NetworkMessage, reliability: Reliability) -> TernResult<()> {
        match self {
            TransportHandle::Unicast(t) => t.send_network(msg, reliability)?,
            TransportHandle::Multicast(t) => t.send_network(msg, reliability)?,
        }
        Ok(())
    }

    fn set_handler(&self, handler: std::sync::Weak<dyn TransportEventHandler>) {
        match self {
            TransportHandle::Unicast(t) => t.set_handler(handler),
            TransportHandle::Multicast(t) => t.set_handler(handler),
        }
    }

    fn start_tasks(&self) -> TernResult<()> {
        match self {
            TransportHandle::Unicast(t) => Arc::clone(t).start_tasks()?,
            TransportHandle::Multicast(t) => Arc::clone(t).start_tasks()?,
        }
        Ok(())
    }

    fn close(&self) {
        match self {
            TransportHandle::Unicast(t) => t.close(),
            TransportHandle::Multicast(t) => t.close(),
        }
    }

    fn take_unacked(&self) -> Vec<NetworkMessage> {
        match self {
            TransportHandle::Unicast(t) => t.take_unacked(),
            TransportHandle::Multicast(_) => Vec::new(),
        }
    }
}

type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;
type QueryHandler = Arc<dyn Fn(crate::Query) + Send + Sync>;

struct SubscriberRec {
    id: u32,
    keyexpr: String,
    callback: SampleCallback,
}

struct QueryableRec {
    id: u32,
    keyexpr: String,
    complete: bool,
    distance: u16,
    callback: QueryHandler,
}

/// A declaration announced by a remote participant.
struct RemoteEntity {
    peer: Option<PeerId>,
    id: u32,
    keyexpr: String,
}

#[derive(Default)]
pub(crate) struct SessionState {
    next_entity: u32,
    resources: ResourceTables,
    subscribers: Vec<SubscriberRec>,
    queryables: Vec<QueryableRec>,
    tokens: Vec<(u32, String)>,
    remote_subscribers: Vec<RemoteEntity>,
    remote_queryables: Vec<RemoteEntity>,
    remote_tokens: Vec<RemoteEntity>,
    /// Expanded keyexpr → matching local subscriber ids.
    sub_cache: HashMap<String, SmallVec<[u32; 2]>>,
    /// Expanded keyexpr → matching local queryable ids.
    qbl_cache: HashMap<String, SmallVec<[u32; 2]>>,
}

impl SessionState {
    fn next_entity_id(&mut self) -> u32 {
        self.next_entity = self.next_entity.wrapping_add(1);
        self.next_entity
    }

    fn invalidate_caches(&mut self) {
        self.sub_cache.clear();
        self.qbl_cache.clear();
    }
}

/// Builds a replacement transport after a failure, capturing whatever the
/// original `open` resolved (endpoint, credentials, negotiated knobs).
pub(crate) type TransportFactory =
    Box<dyn Fn() -> TernResult<TransportHandle> + Send + Sync>;

pub(crate) struct SessionInner {
    pub(crate) zid: ZId,
    pub(crate) mode: Mode,
    pub(crate) config: Config,
    transport: Mutex<Option<TransportHandle>>,
    state: Mutex<SessionState>,
    queries: Mutex<QueryRegistry>,
    pub(crate) time: Arc<dyn TimeProvider>,
    closed: AtomicBool,
    reconnect_factory: Mutex<Option<TransportFactory>>,
    reconnecting: AtomicBool,
    /// Keeps the handler the transports weakly reference alive for the
    /// session's lifetime.
    handler: Mutex<Option<Arc<SessionHandler>>>,
}

impl SessionInner {
    pub(crate) fn new(
        zid: ZId,
        mode: Mode,
        config: Config,
        transport: TransportHandle,
        time: Arc<dyn TimeProvider>,
        reconnect_factory: Option<TransportFactory>,
    ) -> Arc<Self> {
        let inner = Arc::new(Self {
            zid,
            mode,
            config,
            transport: Mutex::new(Some(transport)),
            state: Mutex::new(SessionState::default()),
            queries: Mutex::new(QueryRegistry::default()),
            time,
            closed: AtomicBool::new(false),
            reconnect_factory: Mutex::new(reconnect_factory),
            reconnecting: AtomicBool::new(false),
            handler: Mutex::new(None),
        });
        let handler = Arc::new(SessionHandler {
            session: Arc::downgrade(&inner),
        });
        let weak: std::sync::Weak<dyn TransportEventHandler> =
            Arc::downgrade(&(Arc::clone(&handler) as Arc<dyn TransportEventHandler>));
        *inner.handler.lock() = Some(handler);
        if let Some(transport) = inner.transport.lock().as_ref() {
            transport.set_handler(weak);
        }
        inner
    }

    fn handler_weak(&self) -> Option<std::sync::Weak<dyn TransportEventHandler>> {
        self.handler.lock().as_ref().map(|h| {
            let weak: std::sync::Weak<dyn TransportEventHandler> =
                Arc::downgrade(&(Arc::clone(h) as Arc<dyn TransportEventHandler>));
            weak
        })
    }

    pub(crate) fn start_tasks(&self) -> TernResult<()> {
        let transport = self.transport();
        transport?.start_tasks()
    }

    fn transport(&self) -> TernResult<TransportHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TernError::SessionClosed);
        }
        self.transport
            .lock()
            .clone()
            .ok_or(TernError::SessionClosed)
    }

    pub(crate) fn send(&self, msg: &NetworkMessage, reliability: Reliability) -> TernResult<()> {
        self.transport()?.send(msg, reliability)
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp {
            time_ms: self.time.now_system_ms(),
            id: self.zid,
        }
    }

    // ---- declarations ----------------------------------------------------

    pub(crate) fn declare_keyexpr(&self, key: &str) -> TernResult<(u16, String)> {
        let full = keyexpr::canonicalize(key)?;
        let (rid, wire_expr) = {
            let mut state = self.state.lock();
            if let Some(rid) = state.resources.local.rid_of(&full) {
                // Another handle on the same key shares the RID.
                let wire_expr = WireExpr::from_rid(rid);
                state.resources.local.register(rid, &wire_expr)?;
                return Ok((rid, full));
            }
            let rid = state.resources.next_rid();
            let wire_expr = WireExpr::from_str(&full).to_owned();
            state.resources.local.register(rid, &wire_expr)?;
            (rid, wire_expr)
        };
        let sent = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::KeyExpr { rid, wire_expr },
            },
            Reliability::Reliable,
        );
        if let Err(e) = sent {
            self.state.lock().resources.local.unregister(rid);
            return Err(e);
        }
        Ok((rid, full))
    }

    pub(crate) fn undeclare_keyexpr(&self, rid: u16) {
        self.state.lock().resources.local.unregister(rid);
        let _ = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::UndeclareKeyExpr { rid },
            },
            Reliability::Reliable,
        );
    }

    pub(crate) fn declare_subscriber(
        &self,
        key: &str,
        callback: SampleCallback,
    ) -> TernResult<u32> {
        let full = keyexpr::canonicalize(key)?;
        let id = {
            let mut state = self.state.lock();
            let id = state.next_entity_id();
            state.subscribers.push(SubscriberRec {
                id,
                keyexpr: full.clone(),
                callback,
            });
            state.invalidate_caches();
            id
        };
        let sent = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::Subscriber {
                    id,
                    wire_expr: WireExpr::from_str(&full).to_owned(),
                },
            },
            Reliability::Reliable,
        );
        if let Err(e) = sent {
            // No partial state on failure.
            let mut state = self.state.lock();
            state.subscribers.retain(|s| s.id != id);
            state.invalidate_caches();
            return Err(e);
        }
        Ok(id)
    }

    pub(crate) fn undeclare_subscriber(&self, id: u32) {
        {
            let mut state = self.state.lock();
            state.subscribers.retain(|s| s.id != id);
            state.invalidate_caches();
        }
        let _ = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::UndeclareSubscriber { id },
            },
            Reliability::Reliable,
        );
    }

    pub(crate) fn declare_queryable(
        &self,
        key: &str,
        complete: bool,
        callback: QueryHandler,
    ) -> TernResult<u32> {
        let full = keyexpr::canonicalize(key)?;
        let id = {
            let mut state = self.state.lock();
            let id = state.next_entity_id();
            state.queryables.push(QueryableRec {
                id,
                keyexpr: full.clone(),
                complete,
                distance: 0,
                callback,
            });
            state.invalidate_caches();
            id
        };
        let sent = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::Queryable {
                    id,
                    wire_expr: WireExpr::from_str(&full).to_owned(),
                    complete,
                    distance: 0,
                },
            },
            Reliability::Reliable,
        );
        if let Err(e) = sent {
            let mut state = self.state.lock();
            state.queryables.retain(|q| q.id != id);
            state.invalidate_caches();
            return Err(e);
        }
        Ok(id)
    }

    pub(crate) fn undeclare_queryable(&self, id: u32) {
        {
            let mut state = self.state.lock();
            state.queryables.retain(|q| q.id != id);
            state.invalidate_caches();
        }
        let _ = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::UndeclareQueryable { id },
            },
            Reliability::Reliable,
        );
    }

    pub(crate) fn declare_token(&self, key: &str) -> TernResult<u32> {
        let full = keyexpr::canonicalize(key)?;
        let id = {
            let mut state = self.state.lock();
            let id = state.next_entity_id();
            state.tokens.push((id, full.clone()));
            id
        };
        let sent = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::Token {
                    id,
                    wire_expr: WireExpr::from_str(&full).to_owned(),
                },
            },
            Reliability::Reliable,
        );
        if let Err(e) = sent {
            self.state.lock().tokens.retain(|(tid, _)| *tid != id);
            return Err(e);
        }
        Ok(id)
    }

    pub(crate) fn undeclare_token(&self, id: u32) {
        self.state.lock().tokens.retain(|(tid, _)| *tid != id);
        let _ = self.send(
            &NetworkMessage::Declare {
                body: DeclareBody::UndeclareToken { id },
            },
            Reliability::Reliable,
        );
    }

    // ---- data path -------------------------------------------------------

    pub(crate) fn put_wire(
        &self,
        wire_expr: WireExpr<'static>,
        payload: &[u8],
        opts: PutOptions,
    ) -> TernResult<()> {
        self.send(
            &NetworkMessage::Push {
                wire_expr,
                qos: Priority::default(),
                body: PushBody::Put {
                    timestamp: Some(self.timestamp()),
                    encoding: opts.encoding,
                    payload: payload.to_vec(),
                    attachment: opts.attachment,
                },
            },
            Reliability::Reliable,
        )
    }

    pub(crate) fn delete_wire(&self, wire_expr: WireExpr<'static>) -> TernResult<()> {
        self.send(
            &NetworkMessage::Push {
                wire_expr,
                qos: Priority::default(),
                body: PushBody::Del {
                    timestamp: Some(self.timestamp()),
                },
            },
            Reliability::Reliable,
        )
    }

    pub(crate) fn put(&self, key: &str, payload: &[u8], opts: PutOptions) -> TernResult<()> {
        let full = keyexpr::canonicalize(key)?;
        self.put_wire(WireExpr::from_str(&full).to_owned(), payload, opts)
    }

    pub(crate) fn delete(&self, key: &str) -> TernResult<()> {
        let full = keyexpr::canonicalize(key)?;
        self.delete_wire(WireExpr::from_str(&full).to_owned())
    }

    // ---- queries ---------------------------------------------------------

    pub(crate) fn get(
        &self,
        selector: &str,
        opts: GetOptions,
        reply_cb: query::ReplyCallback,
        drop_cb: query::DropCallback,
    ) -> TernResult<()> {
        let (key, parameters) = match selector.split_once('?') {
            Some((key, params)) => (key, params),
            None => (selector, ""),
        };
        let full = keyexpr::canonicalize(key)?;
        let deadline = self.time.now_instant() + opts.timeout;
        let qid = self
            .queries
            .lock()
            .create(opts.consolidation, deadline, reply_cb, drop_cb);
        let request = NetworkMessage::Request {
            qid,
            wire_expr: WireExpr::from_str(&full).to_owned(),
            target: opts.target,
            timeout_ms: Some(opts.timeout.as_millis() as u64),
            body: RequestBody::Query(QueryBody {
                parameters: parameters.to_string(),
                payload: opts.payload.map(|p| (opts.encoding, p)),
            }),
        };
        if let Err(e) = self.send(&request, Reliability::Reliable) {
            // The query never left: unwind it without firing callbacks.
            self.queries.lock().finish(qid);
            return Err(e);
        }
        Ok(())
    }

    fn run_finish(&self, finish: QueryFinish) {
        for reply in finish.flush {
            self.invoke_reply(&finish.reply_cb, reply);
        }
        if let Some(drop_cb) = finish.drop_cb {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(drop_cb)) {
                error!(?payload, "query drop callback panicked");
            }
        }
    }

    fn invoke_reply(&self, cb: &query::ReplyCallback, reply: Reply) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cb(reply))) {
            error!(?payload, "reply callback panicked");
        }
    }

    // ---- inbound dispatch ------------------------------------------------

    fn dispatch_push(&self, wire_expr: WireExpr<'static>, body: PushBody, peer: Option<PeerId>) {
        let state = self.state.lock();
        let key = match state.resources.expand_remote(&wire_expr, peer) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping push with unresolvable key");
                return;
            }
        };
        drop(state);

        let sample = match body {
            PushBody::Put {
                timestamp,
                encoding,
                payload,
                attachment,
            } => Sample {
                keyexpr: key.clone(),
                payload,
                kind: SampleKind::Put,
                encoding,
                timestamp,
                attachment,
            },
            PushBody::Del { timestamp } => Sample {
                keyexpr: key.clone(),
                payload: Vec::new(),
                kind: SampleKind::Delete,
                encoding: Encoding::default(),
                timestamp,
                attachment: None,
            },
        };

        let callbacks: SmallVec<[SampleCallback; 2]> = {
            let mut state = self.state.lock();
            let ids = match state.sub_cache.get(&key) {
                Some(ids) => ids.clone(),
                None => {
                    let ids: SmallVec<[u32; 2]> = state
                        .subscribers
                        .iter()
                        .filter(|s| keyexpr::intersects(&s.keyexpr, &key))
                        .map(|s| s.id)
                        .collect();
                    state.sub_cache.insert(key.clone(), ids.clone());
                    ids
                }
            };
            state
                .subscribers
                .iter()
                .filter(|s| ids.contains(&s.id))
                .map(|s| s.callback.clone())
                .collect()
        };

        for callback in callbacks {
            let sample = sample.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(sample))) {
                error!(?payload, "subscriber callback panicked");
            }
        }
    }

    fn dispatch_request(
        self: Arc<Self>,
        qid: u64,
        wire_expr: WireExpr<'static>,
        target: tern_proto::core::QueryTarget,
        body: RequestBody,
        peer: Option<PeerId>,
    ) {
        let state = self.state.lock();
        let key = match state.resources.expand_remote(&wire_expr, peer) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping request with unresolvable key");
                return;
            }
        };
        drop(state);

        let handlers: SmallVec<[QueryHandler; 2]> = {
            let mut state = self.state.lock();
            let ids = match state.qbl_cache.get(&key) {
                Some(ids) => ids.clone(),
                None => {
                    let ids: SmallVec<[u32; 2]> = state
                        .queryables
                        .iter()
                        .filter(|q| keyexpr::intersects(&q.keyexpr, &key))
                        .map(|q| q.id)
                        .collect();
                    state.qbl_cache.insert(key.clone(), ids.clone());
                    ids
                }
            };
            state
                .queryables
                .iter()
                .filter(|q| ids.contains(&q.id))
                .filter(|q| {
                    target != tern_proto::core::QueryTarget::AllComplete || q.complete
                })
                .map(|q| q.callback.clone())
                .collect()
        };

        if handlers.is_empty() {
            // Unblock the requester right away.
            let _ = self.send(
                &NetworkMessage::ResponseFinal { qid },
                Reliability::Reliable,
            );
            return;
        }

        let RequestBody::Query(query_body) = body;
        let query = crate::Query {
            inner: Arc::new(QueryInner {
                session: Arc::clone(&self),
                qid,
                keyexpr: key,
                parameters: query_body.parameters,
                payload: query_body.payload,
            }),
        };
        for handler in handlers {
            let query = query.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(query))) {
                error!(?payload, "queryable handler panicked");
            }
        }
        // The last clone dropping sends ResponseFinal.
    }

    fn dispatch_response(
        &self,
        qid: u64,
        wire_expr: WireExpr<'static>,
        replier: Option<ZId>,
        body: ResponseBody,
        peer: Option<PeerId>,
    ) {
        let state = self.state.lock();
        let key = match state.resources.expand_remote(&wire_expr, peer) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping reply with unresolvable key");
                return;
            }
        };
        drop(state);

        let reply = match body {
            ResponseBody::Reply(ReplyBody {
                timestamp,
                encoding,
                payload,
            }) => Reply::Ok {
                sample: Sample {
                    keyexpr: key.clone(),
                    payload,
                    kind: SampleKind::Put,
                    encoding,
                    timestamp,
                    attachment: None,
                },
                replier,
            },
            ResponseBody::Err { payload } => Reply::Err { payload },
        };

        let forwarded = self.queries.lock().on_reply(qid, &key, replier, reply);
        if let Some((cb, reply)) = forwarded {
            self.invoke_reply(&cb, reply);
        }
    }

    fn dispatch_declare(&self, declare: DeclareBody, peer: Option<PeerId>) {
        let mut state = self.state.lock();
        match declare {
            DeclareBody::KeyExpr { rid, wire_expr } => {
                if let Err(e) = state.resources.remote(peer).register(rid, &wire_expr) {
                    warn!(error = %e, rid, "rejecting remote key declaration");
                }
            }
            DeclareBody::UndeclareKeyExpr { rid } => {
                state.resources.remote(peer).unregister(rid);
            }
            DeclareBody::Subscriber { id, wire_expr } => {
                if let Ok(key) = state.resources.expand_remote(&wire_expr, peer) {
                    state.remote_subscribers.push(RemoteEntity {
                        peer,
                        id,
                        keyexpr: key,
                    });
                }
            }
            DeclareBody::UndeclareSubscriber { id } => {
                state
                    .remote_subscribers
                    .retain(|e| !(e.peer == peer && e.id == id));
            }
            DeclareBody::Queryable { id, wire_expr, .. } => {
                if let Ok(key) = state.resources.expand_remote(&wire_expr, peer) {
                    state.remote_queryables.push(RemoteEntity {
                        peer,
                        id,
                        keyexpr: key,
                    });
                }
            }
            DeclareBody::UndeclareQueryable { id } => {
                state
                    .remote_queryables
                    .retain(|e| !(e.peer == peer && e.id == id));
            }
            DeclareBody::Token { id, wire_expr } => {
                if let Ok(key) = state.resources.expand_remote(&wire_expr, peer) {
                    state.remote_tokens.push(RemoteEntity {
                        peer,
                        id,
                        keyexpr: key,
                    });
                }
            }
            DeclareBody::UndeclareToken { id } => {
                state
                    .remote_tokens
                    .retain(|e| !(e.peer == peer && e.id == id));
            }
            DeclareBody::Final => {}
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Re-announce every local declaration, after (re)connecting.
    fn redeclare_all(&self) -> TernResult<()> {
        let declares: Vec<NetworkMessage> = {
            let state = self.state.lock();
            let mut out = Vec::new();
            for (rid, key) in state.resources.local.iter() {
                out.push(NetworkMessage::Declare {
                    body: DeclareBody::KeyExpr {
                        rid,
                        wire_expr: WireExpr::from_str(key).to_owned(),
                    },
                });
            }
            for sub in &state.subscribers {
                out.push(NetworkMessage::Declare {
                    body: DeclareBody::Subscriber {
                        id: sub.id,
                        wire_expr: WireExpr::from_str(&sub.keyexpr).to_owned(),
                    },
                });
            }
            for qbl in &state.queryables {
                out.push(NetworkMessage::Declare {
                    body: DeclareBody::Queryable {
                        id: qbl.id,
                        wire_expr: WireExpr::from_str(&qbl.keyexpr).to_owned(),
                        complete: qbl.complete,
                        distance: qbl.distance,
                    },
                });
            }
            for (id, key) in &state.tokens {
                out.push(NetworkMessage::Declare {
                    body: DeclareBody::Token {
                        id: *id,
                        wire_expr: WireExpr::from_str(key).to_owned(),
                    },
                });
            }
            out
        };
        for msg in declares {
            self.send(&msg, Reliability::Reliable)?;
        }
        Ok(())
    }

    fn reopen(self: Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let enabled = self.config.auto_reconnect().unwrap_or(false);
        let has_factory = self.reconnect_factory.lock().is_some();
        if !enabled || !has_factory {
            info!("transport failed and auto-reconnect is off; session is done");
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = Arc::clone(&self);
        let spawned = std::thread::Builder::new()
            .name("tern-reopen".into())
            .spawn(move || me.reopen_loop());
        if spawned.is_err() {
            self.reconnecting.store(false, Ordering::Release);
        }
    }

    /// Exponential backoff with jitter, the decode/link recovery policy.
    fn reopen_loop(self: Arc<Self>) {
        let unacked = {
            let transport = self.transport.lock().take();
            transport.map(|t| t.take_unacked()).unwrap_or_default()
        };
        let mut backoff = Duration::from_millis(500);
        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let jitter = Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..250));
            std::thread::sleep(backoff + jitter);
            let attempt = {
                let factory = self.reconnect_factory.lock();
                match factory.as_ref() {
                    Some(factory) => factory(),
                    None => break,
                }
            };
            match attempt {
                Ok(transport) => {
                    if let Some(weak) = self.handler_weak() {
                        transport.set_handler(weak);
                    }
                    *self.transport.lock() = Some(transport.clone());
                    if let Err(e) = transport.start_tasks() {
                        warn!(error = %e, "restarting tasks failed");
                        continue;
                    }
                    info!("session reopened");
                    if let Err(e) = self.redeclare_all() {
                        warn!(error = %e, "redeclaration after reopen failed");
                    }
                    for msg in &unacked {
                        let _ = self.send(msg, Reliability::Reliable);
                    }
                    break;
                }
                Err(e) => {
                    debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "reopen attempt failed");
                    backoff = (backoff * 2).min(Duration::from_secs(32));
                }
            }
        }
        self.reconnecting.store(false, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Cancel outstanding queries: the drop callback still fires exactly
        // once, with whatever was buffered.
        let finishes = self.queries.lock().drain();
        for finish in finishes {
            self.run_finish(finish);
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        info!(zid = %self.zid, "session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Some(transport) = self.transport.lock().take() {
                transport.close();
            }
        }
    }
}

/// The transport-facing side of a session. Transports hold this weakly;
/// the session owns the one strong reference, so a dropped session stops
/// receiving without any teardown ceremony.
pub(crate) struct SessionHandler {
    session: std::sync::Weak<SessionInner>,
}

impl TransportEventHandler for SessionHandler {
    fn handle_message(&self, msg: NetworkMessage, peer: Option<PeerId>) {
        let Some(this) = self.session.upgrade() else {
            return;
        };
        match msg {
            NetworkMessage::Push {
                wire_expr, body, ..
            } => this.dispatch_push(wire_expr, body, peer),
            NetworkMessage::Request {
                qid,
                wire_expr,
                target,
                body,
                ..
            } => this.dispatch_request(qid, wire_expr, target, body, peer),
            NetworkMessage::Response {
                qid,
                wire_expr,
                replier,
                body,
            } => this.dispatch_response(qid, wire_expr, replier, body, peer),
            NetworkMessage::ResponseFinal { qid } => {
                let finish = this.queries.lock().finish(qid);
                if let Some(finish) = finish {
                    this.run_finish(finish);
                }
            }
            NetworkMessage::Declare { body } => this.dispatch_declare(body, peer),
            NetworkMessage::Oam { oam_id, .. } => {
                debug!(oam_id, "ignoring control message");
            }
        }
    }

    fn peer_joined(&self, peer: PeerId, zid: ZId) {
        debug!(?peer, %zid, "peer joined");
    }

    fn peer_left(&self, peer: PeerId, zid: ZId) {
        let Some(this) = self.session.upgrade() else {
            return;
        };
        let mut state = this.state.lock();
        state.resources.drop_peer(peer);
        state.remote_subscribers.retain(|e| e.peer != Some(peer));
        state.remote_queryables.retain(|e| e.peer != Some(peer));
        state.remote_tokens.retain(|e| e.peer != Some(peer));
        state.invalidate_caches();
        drop(state);
        info!(%zid, "peer disconnected");
    }

    fn transport_failed(&self) {
        if let Some(this) = self.session.upgrade() {
            warn!("transport failed");
            this.reopen();
        }
    }

    fn lease_tick(&self, now: Instant) {
        if let Some(this) = self.session.upgrade() {
            let finishes = this.queries.lock().expired(now);
            for finish in finishes {
                this.run_finish(finish);
            }
        }
    }
}

/// One inbound query being served by local queryables. Dropping the last
/// handle sends the terminating ResponseFinal.
pub(crate) struct QueryInner {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) qid: u64,
    pub(crate) keyexpr: String,
    pub(crate) parameters: String,
    pub(crate) payload: Option<(Encoding, Vec<u8>)>,
}

impl QueryInner {
    pub(crate) fn reply(&self, key: &str, payload: &[u8], encoding: Encoding) -> TernResult<()> {
        let full = keyexpr::canonicalize(key)?;
        self.session.send(
            &NetworkMessage::Response {
                qid: self.qid,
                wire_expr: WireExpr::from_str(&full).to_owned(),
                replier: Some(self.session.zid),
                body: ResponseBody::Reply(ReplyBody {
                    timestamp: Some(self.session.timestamp()),
                    encoding,
                    payload: payload.to_vec(),
                }),
            },
            Reliability::Reliable,
        )
    }

    pub(crate) fn reply_err(&self, payload: &[u8]) -> TernResult<()> {
        self.session.send(
            &NetworkMessage::Response {
                qid: self.qid,
                wire_expr: WireExpr::from_str(&self.keyexpr).to_owned(),
                replier: Some(self.session.zid),
                body: ResponseBody::Err {
                    payload: payload.to_vec(),
                },
            },
            Reliability::Reliable,
        )
    }

    pub(crate) fn params(&self) -> QueryParams<'_> {
        query_params(&self.parameters)
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        let _ = self.session.send(
            &NetworkMessage::ResponseFinal { qid: self.qid },
            Reliability::Reliable,
        );
    }
}
