//! # Terncore
//!
//! A lightweight pub/sub + query client for the tern overlay, sized for
//! constrained endpoints.
//!
//! A [`Session`] attaches to a single router over a reliable unicast link
//! (client mode) or participates in a multicast group with symmetric state
//! toward every discovered neighbor (peer mode). On top of the session sit
//! declarations ([`Session::declare_subscriber`],
//! [`Session::declare_queryable`]), data ([`Session::put`],
//! [`Session::delete`]) and queries ([`Session::get`]).
//!
//! ```no_run
//! use terncore::{Config, Session};
//!
//! let mut config = Config::new();
//! config.insert("connect", "tcp/127.0.0.1:7447")?;
//! let session = Session::open(config)?;
//! let _sub = session.declare_subscriber("demo/example/**", |sample| {
//!     println!("{} = {:?}", sample.keyexpr, sample.payload);
//! })?;
//! session.put("demo/example/a", b"hello")?;
//! # Ok::<(), terncore::TernError>(())
//! ```

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod session;
pub mod testing;
pub mod types;
pub mod utils;

use parking_lot::{Condvar, Mutex};
use session::query::{DropCallback, ReplyCallback};
use session::{QueryInner, SessionInner, TransportFactory, TransportHandle};
use std::sync::Arc;
use std::time::Duration;
use tern_proto::core::{Encoding, WireExpr};
use tern_proto::transport::Auth;
use tern_transport::multicast::{MulticastConfig, MulticastTransport};
use tern_transport::unicast::{UnicastConfig, UnicastTransport};
use tern_transport::{Endpoint, Protocol, SystemTimeProvider, TcpLink, TimeProvider, UdpMulticastLink, UdpUnicastLink};
use tracing::debug;

pub use config::{Config, Mode};
pub use error::{TernError, TernResult};
pub use tern_proto::core::{
    ConsolidationMode, Priority, QueryTarget, Reliability, Timestamp, WhatAmI, WhatAmIMatcher, ZId,
};
pub use tern_transport::scout::HelloInfo;
pub use types::{GetOptions, PutOptions, Reply, Sample, SampleKind, GET_TIMEOUT_DEFAULT};
pub use utils::query_params::QueryParams;
pub use utils::time_range::{TimeBound, TimeRange};

/// How long `open` waits for a handshake before giving up.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to the overlay. Cheap to clone through the entity handles;
/// closing (or dropping the last handle) tears the transport down.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Session {
        Session { inner }
    }

    /// Open a session as configured: connect to a router in client mode
    /// (scouting for one when no endpoint is given), join the multicast
    /// group in peer mode.
    pub fn open(config: Config) -> TernResult<Session> {
        config.validate()?;
        let mode = config.mode()?;
        let zid = ZId::random();
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let lease_ms = config.lease_ms()?;

        let (transport, factory): (TransportHandle, Option<TransportFactory>) = match mode {
            Mode::Client => {
                let auth = config.auth()?;
                let mut endpoints: Vec<String> =
                    config.connect_endpoints().iter().map(|s| s.to_string()).collect();
                if endpoints.is_empty() && config.scouting_enabled()? {
                    endpoints = scout_for_router(&config, zid)?;
                }
                if endpoints.is_empty() {
                    return Err(TernError::InvalidArgument(
                        "no endpoint to connect and scouting found no router".to_string(),
                    ));
                }
                let transport =
                    connect_client(&endpoints, zid, lease_ms, &auth, &time)?;
                let factory_time = Arc::clone(&time);
                let factory: TransportFactory = Box::new(move || {
                    connect_client(&endpoints, zid, lease_ms, &auth, &factory_time)
                });
                (transport, Some(factory))
            }
            Mode::Peer => {
                let group = config
                    .connect_endpoints()
                    .first()
                    .map(|s| s.to_string())
                    .or_else(|| config.listen_endpoints().first().map(|s| s.to_string()))
                    .unwrap_or_else(|| config.scouting_address().to_string());
                let endpoint = Endpoint::parse(&group)?;
                if endpoint.protocol != Protocol::Udp || !endpoint.is_multicast() {
                    return Err(TernError::InvalidArgument(format!(
                        "peer mode needs a udp multicast group, got `{group}`"
                    )));
                }
                let link = Arc::new(UdpMulticastLink::open(&endpoint)?);
                let transport = MulticastTransport::open(
                    link,
                    MulticastConfig {
                        zid,
                        lease_ms,
                        ..Default::default()
                    },
                    Arc::clone(&time),
                )?;
                (TransportHandle::Multicast(transport), None)
            }
        };

        let inner = SessionInner::new(zid, mode, config, transport, time, factory);
        inner.start_tasks()?;
        Ok(Session { inner })
    }

    pub fn zid(&self) -> ZId {
        self.inner.zid
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Orderly shutdown: cancel pending queries (their drop callbacks still
    /// fire exactly once), close the transport, join its tasks.
    pub fn close(self) -> TernResult<()> {
        self.inner.close();
        Ok(())
    }

    /// Cache a key-expression prefix on the wire, getting back a handle
    /// whose drop undeclares it.
    pub fn declare_keyexpr(&self, key: &str) -> TernResult<KeyExpr> {
        let (rid, full) = self.inner.declare_keyexpr(key)?;
        Ok(KeyExpr {
            session: Arc::clone(&self.inner),
            rid,
            full,
        })
    }

    /// Subscribe to every sample whose key intersects `key`.
    pub fn declare_subscriber(
        &self,
        key: &str,
        callback: impl Fn(Sample) + Send + Sync + 'static,
    ) -> TernResult<Subscriber> {
        let id = self.inner.declare_subscriber(key, Arc::new(callback))?;
        Ok(Subscriber {
            session: Arc::clone(&self.inner),
            id,
        })
    }

    /// Serve queries whose selector intersects `key`. `complete` declares
    /// this queryable authoritative for the whole of `key`.
    pub fn declare_queryable(
        &self,
        key: &str,
        complete: bool,
        handler: impl Fn(Query) + Send + Sync + 'static,
    ) -> TernResult<Queryable> {
        let id = self
            .inner
            .declare_queryable(key, complete, Arc::new(handler))?;
        Ok(Queryable {
            session: Arc::clone(&self.inner),
            id,
        })
    }

    /// A publisher caches its key expression and reuses the RID on every
    /// put.
    pub fn declare_publisher(&self, key: &str) -> TernResult<Publisher> {
        Ok(Publisher {
            keyexpr: self.declare_keyexpr(key)?,
        })
    }

    /// Declare a liveliness token on `key`; peers observe its departure.
    pub fn liveliness_token(&self, key: &str) -> TernResult<LivelinessToken> {
        let id = self.inner.declare_token(key)?;
        Ok(LivelinessToken {
            session: Arc::clone(&self.inner),
            id,
        })
    }

    pub fn put(&self, key: &str, payload: &[u8]) -> TernResult<()> {
        self.inner.put(key, payload, PutOptions::default())
    }

    pub fn put_with(&self, key: &str, payload: &[u8], opts: PutOptions) -> TernResult<()> {
        self.inner.put(key, payload, opts)
    }

    pub fn delete(&self, key: &str) -> TernResult<()> {
        self.inner.delete(key)
    }

    /// Issue a query. Replies arrive on `on_reply`; `on_done` fires exactly
    /// once when the query terminates (final reply, timeout or session
    /// close), after any consolidated replies were flushed.
    pub fn get(
        &self,
        selector: &str,
        opts: GetOptions,
        on_reply: impl Fn(Reply) + Send + Sync + 'static,
        on_done: impl FnOnce() + Send + 'static,
    ) -> TernResult<()> {
        let reply_cb: ReplyCallback = Arc::new(on_reply);
        let drop_cb: DropCallback = Box::new(on_done);
        self.inner.get(selector, opts, reply_cb, drop_cb)
    }

    /// The blocking variant: wait on a condvar until the query terminates
    /// and hand back everything it produced.
    pub fn get_collect(&self, selector: &str, opts: GetOptions) -> TernResult<Vec<Reply>> {
        struct Collect {
            state: Mutex<(Vec<Reply>, bool)>,
            done: Condvar,
        }
        let collect = Arc::new(Collect {
            state: Mutex::new((Vec::new(), false)),
            done: Condvar::new(),
        });
        let timeout = opts.timeout;
        let on_reply = {
            let collect = Arc::clone(&collect);
            move |reply: Reply| {
                collect.state.lock().0.push(reply);
            }
        };
        let on_done = {
            let collect = Arc::clone(&collect);
            move || {
                collect.state.lock().1 = true;
                collect.done.notify_all();
            }
        };
        self.get(selector, opts, on_reply, on_done)?;

        let mut guard = collect.state.lock();
        // Grace beyond the query deadline covers a dying lease task.
        let wait_bound = timeout + Duration::from_secs(5);
        while !guard.1 {
            if collect.done.wait_for(&mut guard, wait_bound).timed_out() {
                return Err(TernError::Timeout);
            }
        }
        let replies = std::mem::take(&mut guard.0);
        Ok(replies)
    }

    /// Discover participants over UDP multicast scouting.
    pub fn scout(config: &Config, what: WhatAmIMatcher) -> TernResult<Vec<HelloInfo>> {
        let endpoint = Endpoint::parse(config.scouting_address())?;
        let timeout = Duration::from_millis(config.scouting_timeout_ms()?);
        let hellos = tern_transport::scout(&endpoint, what, ZId::random(), timeout, |_| false)?;
        Ok(hellos)
    }
}

fn scout_for_router(config: &Config, zid: ZId) -> TernResult<Vec<String>> {
    let endpoint = Endpoint::parse(config.scouting_address())?;
    let timeout = Duration::from_millis(config.scouting_timeout_ms()?);
    debug!(%endpoint, "scouting for a router");
    let hellos = tern_transport::scout(&endpoint, WhatAmIMatcher::ROUTER, zid, timeout, |hs| {
        !hs.is_empty()
    })?;
    Ok(hellos
        .into_iter()
        .next()
        .map(|h| h.locators)
        .unwrap_or_default())
}

/// Try each endpoint in order until one opens.
fn connect_client(
    endpoints: &[String],
    zid: ZId,
    lease_ms: u64,
    auth: &Option<Auth>,
    time: &Arc<dyn TimeProvider>,
) -> TernResult<TransportHandle> {
    let mut last_err = TernError::InvalidArgument("no endpoints".to_string());
    for raw in endpoints {
        let endpoint = match Endpoint::parse(raw) {
            Ok(ep) => ep,
            Err(e) => {
                last_err = e.into();
                continue;
            }
        };
        let link: Arc<dyn tern_transport::Link> = match endpoint.protocol {
            Protocol::Tcp => match TcpLink::open(&endpoint, OPEN_TIMEOUT) {
                Ok(link) => Arc::new(link),
                Err(e) => {
                    last_err = e.into();
                    continue;
                }
            },
            Protocol::Udp => match UdpUnicastLink::open(&endpoint) {
                Ok(link) => Arc::new(link),
                Err(e) => {
                    last_err = e.into();
                    continue;
                }
            },
        };
        let cfg = UnicastConfig {
            zid,
            lease_ms,
            auth: auth.clone(),
            ..Default::default()
        };
        match UnicastTransport::open(link, cfg, Arc::clone(time), OPEN_TIMEOUT) {
            Ok(transport) => return Ok(TransportHandle::Unicast(transport)),
            Err(e) => last_err = e.into(),
        }
    }
    Err(last_err)
}

/// A declared key-expression prefix; drop undeclares it.
pub struct KeyExpr {
    session: Arc<SessionInner>,
    rid: u16,
    full: String,
}

impl KeyExpr {
    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn rid(&self) -> u16 {
        self.rid
    }
}

impl Drop for KeyExpr {
    fn drop(&mut self) {
        self.session.undeclare_keyexpr(self.rid);
    }
}

/// An active subscription; drop undeclares it.
pub struct Subscriber {
    session: Arc<SessionInner>,
    id: u32,
}

impl Subscriber {
    pub fn undeclare(self) -> TernResult<()> {
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.session.undeclare_subscriber(self.id);
    }
}

/// An active queryable; drop undeclares it.
pub struct Queryable {
    session: Arc<SessionInner>,
    id: u32,
}

impl Queryable {
    pub fn undeclare(self) -> TernResult<()> {
        Ok(())
    }
}

impl Drop for Queryable {
    fn drop(&mut self) {
        self.session.undeclare_queryable(self.id);
    }
}

/// A declared liveliness token; dropping it signals departure.
pub struct LivelinessToken {
    session: Arc<SessionInner>,
    id: u32,
}

impl Drop for LivelinessToken {
    fn drop(&mut self) {
        self.session.undeclare_token(self.id);
    }
}

/// A publisher bound to a cached key expression.
pub struct Publisher {
    keyexpr: KeyExpr,
}

impl Publisher {
    pub fn keyexpr(&self) -> &str {
        self.keyexpr.as_str()
    }

    pub fn put(&self, payload: &[u8]) -> TernResult<()> {
        self.put_with(payload, PutOptions::default())
    }

    pub fn put_with(&self, payload: &[u8], opts: PutOptions) -> TernResult<()> {
        self.keyexpr
            .session
            .put_wire(WireExpr::from_rid(self.keyexpr.rid), payload, opts)
    }

    pub fn delete(&self) -> TernResult<()> {
        self.keyexpr
            .session
            .delete_wire(WireExpr::from_rid(self.keyexpr.rid))
    }
}

/// One query being served by a queryable handler. Replies go back with
/// [`Query::reply`]; when the last clone drops, the terminating
/// ResponseFinal is sent automatically.
#[derive(Clone)]
pub struct Query {
    pub(crate) inner: Arc<QueryInner>,
}

impl Query {
    pub fn keyexpr(&self) -> &str {
        &self.inner.keyexpr
    }

    pub fn parameters(&self) -> &str {
        &self.inner.parameters
    }

    pub fn params(&self) -> QueryParams<'_> {
        self.inner.params()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.inner.payload.as_ref().map(|(_, p)| p.as_slice())
    }

    pub fn reply(&self, key: &str, payload: &[u8]) -> TernResult<()> {
        self.inner.reply(key, payload, Encoding::default())
    }

    pub fn reply_with(&self, key: &str, payload: &[u8], encoding: Encoding) -> TernResult<()> {
        self.inner.reply(key, payload, encoding)
    }

    pub fn reply_err(&self, payload: &[u8]) -> TernResult<()> {
        self.inner.reply_err(payload)
    }
}
