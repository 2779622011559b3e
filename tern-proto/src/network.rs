//! Network-level messages: the payload of Frame and Fragment chains.
//!
//! Push carries data samples, Request/Response/ResponseFinal carry the
//! query exchange, Declare distributes entity declarations, OAM is opaque
//! control traffic the session layer forwards or ignores.

use crate::core::{Encoding, Priority, QueryTarget, Timestamp, WireExpr, ZId};
use crate::error::{ProtoError, ProtoResult};
use crate::ext::{self, ZExt};
use crate::zint::{Reader, Writer};

pub mod id {
    pub const RESPONSE_FINAL: u8 = 0x1a;
    pub const RESPONSE: u8 = 0x1b;
    pub const REQUEST: u8 = 0x1c;
    pub const PUSH: u8 = 0x1d;
    pub const DECLARE: u8 = 0x1e;
    pub const OAM: u8 = 0x1f;
}

/// Declare body ids.
pub mod declare_id {
    pub const KEYEXPR: u8 = 0x00;
    pub const UNDECLARE_KEYEXPR: u8 = 0x01;
    pub const SUBSCRIBER: u8 = 0x02;
    pub const UNDECLARE_SUBSCRIBER: u8 = 0x03;
    pub const QUERYABLE: u8 = 0x04;
    pub const UNDECLARE_QUERYABLE: u8 = 0x05;
    pub const TOKEN: u8 = 0x06;
    pub const UNDECLARE_TOKEN: u8 = 0x07;
    pub const FINAL: u8 = 0x08;
}

/// Network extension ids.
pub mod ext_id {
    pub const QOS: u8 = 0x01;
    pub const TIMESTAMP: u8 = 0x02;
    pub const REPLIER_ID: u8 = 0x03;
    pub const TARGET: u8 = 0x04;
    pub const TIMEOUT: u8 = 0x05;
    pub const ATTACHMENT: u8 = 0x06;
}

const ID_MASK: u8 = 0x1f;
const FLAG_Z: u8 = 0x80;
/// Wire expression carries a named suffix.
const FLAG_N: u8 = 0x20;

/// Push payload: a data sample or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushBody {
    Put {
        timestamp: Option<Timestamp>,
        encoding: Encoding,
        payload: Vec<u8>,
        attachment: Option<Vec<u8>>,
    },
    Del {
        timestamp: Option<Timestamp>,
    },
}

const BODY_PUT: u8 = 0x01;
const BODY_DEL: u8 = 0x02;
const BODY_QUERY: u8 = 0x01;
const BODY_REPLY: u8 = 0x01;
const BODY_ERR: u8 = 0x02;
/// Body flags.
const FLAG_E: u8 = 0x20;
const FLAG_T: u8 = 0x40;
const FLAG_V: u8 = 0x40;

impl PushBody {
    fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        match self {
            PushBody::Put {
                timestamp,
                encoding,
                payload,
                attachment,
            } => {
                let mut header = BODY_PUT;
                if *encoding != Encoding::default() {
                    header |= FLAG_E;
                }
                if timestamp.is_some() {
                    header |= FLAG_T;
                }
                if attachment.is_some() {
                    header |= FLAG_Z;
                }
                w.write_u8(header)?;
                if let Some(ts) = timestamp {
                    ts.encode(w)?;
                }
                if header & FLAG_E != 0 {
                    encoding.encode(w)?;
                }
                w.write_bytes(payload)?;
                if let Some(att) = attachment {
                    ext::encode(w, &[ZExt::new(ext_id::ATTACHMENT, false, att.clone())])?;
                }
            }
            PushBody::Del { timestamp } => {
                let mut header = BODY_DEL;
                if timestamp.is_some() {
                    header |= FLAG_T;
                }
                w.write_u8(header)?;
                if let Some(ts) = timestamp {
                    ts.encode(w)?;
                }
            }
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let header = r.read_u8()?;
        match header & ID_MASK {
            BODY_PUT => {
                let timestamp = if header & FLAG_T != 0 {
                    Some(Timestamp::decode(r)?)
                } else {
                    None
                };
                let encoding = if header & FLAG_E != 0 {
                    Encoding::decode(r)?
                } else {
                    Encoding::default()
                };
                let payload = r.read_bytes()?.to_vec();
                let mut attachment = None;
                let exts = ext::decode_if(r, header & FLAG_Z != 0)?;
                ext::visit(&exts, |e| {
                    if e.id == ext_id::ATTACHMENT {
                        attachment = Some(e.body.clone());
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                })?;
                Ok(PushBody::Put {
                    timestamp,
                    encoding,
                    payload,
                    attachment,
                })
            }
            BODY_DEL => {
                let timestamp = if header & FLAG_T != 0 {
                    Some(Timestamp::decode(r)?)
                } else {
                    None
                };
                Ok(PushBody::Del { timestamp })
            }
            other => Err(ProtoError::UnknownMessage(other)),
        }
    }
}

/// Request payload. Only queries for now; the id space leaves room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Query(QueryBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryBody {
    pub parameters: String,
    pub payload: Option<(Encoding, Vec<u8>)>,
}

impl RequestBody {
    fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        let RequestBody::Query(q) = self;
        let mut header = BODY_QUERY;
        if q.payload.is_some() {
            header |= FLAG_V;
        }
        w.write_u8(header)?;
        w.write_string(&q.parameters)?;
        if let Some((encoding, payload)) = &q.payload {
            encoding.encode(w)?;
            w.write_bytes(payload)?;
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let header = r.read_u8()?;
        if header & ID_MASK != BODY_QUERY {
            return Err(ProtoError::UnknownMessage(header & ID_MASK));
        }
        let parameters = r.read_string()?;
        let payload = if header & FLAG_V != 0 {
            let encoding = Encoding::decode(r)?;
            Some((encoding, r.read_bytes()?.to_vec()))
        } else {
            None
        };
        Ok(RequestBody::Query(QueryBody {
            parameters,
            payload,
        }))
    }
}

/// Response payload: a data reply or an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Reply(ReplyBody),
    Err { payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBody {
    pub timestamp: Option<Timestamp>,
    pub encoding: Encoding,
    pub payload: Vec<u8>,
}

impl ResponseBody {
    fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        match self {
            ResponseBody::Reply(reply) => {
                let mut header = BODY_REPLY;
                if reply.timestamp.is_some() {
                    header |= FLAG_T;
                }
                if reply.encoding != Encoding::default() {
                    header |= FLAG_E;
                }
                w.write_u8(header)?;
                if let Some(ts) = &reply.timestamp {
                    ts.encode(w)?;
                }
                if header & FLAG_E != 0 {
                    reply.encoding.encode(w)?;
                }
                w.write_bytes(&reply.payload)?;
            }
            ResponseBody::Err { payload } => {
                w.write_u8(BODY_ERR)?;
                w.write_bytes(payload)?;
            }
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let header = r.read_u8()?;
        match header & ID_MASK {
            BODY_REPLY => {
                let timestamp = if header & FLAG_T != 0 {
                    Some(Timestamp::decode(r)?)
                } else {
                    None
                };
                let encoding = if header & FLAG_E != 0 {
                    Encoding::decode(r)?
                } else {
                    Encoding::default()
                };
                let payload = r.read_bytes()?.to_vec();
                Ok(ResponseBody::Reply(ReplyBody {
                    timestamp,
                    encoding,
                    payload,
                }))
            }
            BODY_ERR => Ok(ResponseBody::Err {
                payload: r.read_bytes()?.to_vec(),
            }),
            other => Err(ProtoError::UnknownMessage(other)),
        }
    }
}

/// Declaration bodies distributed by Declare messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclareBody {
    KeyExpr { rid: u16, wire_expr: WireExpr<'static> },
    UndeclareKeyExpr { rid: u16 },
    Subscriber { id: u32, wire_expr: WireExpr<'static> },
    UndeclareSubscriber { id: u32 },
    Queryable {
        id: u32,
        wire_expr: WireExpr<'static>,
        complete: bool,
        distance: u16,
    },
    UndeclareQueryable { id: u32 },
    Token { id: u32, wire_expr: WireExpr<'static> },
    UndeclareToken { id: u32 },
    Final,
}

/// Queryable completeness flag on the Declare body header.
const FLAG_C: u8 = 0x40;

impl DeclareBody {
    fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        match self {
            DeclareBody::KeyExpr { rid, wire_expr } => {
                let mut header = declare_id::KEYEXPR;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                w.write_u8(header)?;
                w.write_zint(u64::from(*rid))?;
                wire_expr.encode(w)?;
            }
            DeclareBody::UndeclareKeyExpr { rid } => {
                w.write_u8(declare_id::UNDECLARE_KEYEXPR)?;
                w.write_zint(u64::from(*rid))?;
            }
            DeclareBody::Subscriber { id, wire_expr } => {
                let mut header = declare_id::SUBSCRIBER;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                w.write_u8(header)?;
                w.write_zint(u64::from(*id))?;
                wire_expr.encode(w)?;
            }
            DeclareBody::UndeclareSubscriber { id } => {
                w.write_u8(declare_id::UNDECLARE_SUBSCRIBER)?;
                w.write_zint(u64::from(*id))?;
            }
            DeclareBody::Queryable {
                id,
                wire_expr,
                complete,
                distance,
            } => {
                let mut header = declare_id::QUERYABLE;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                if *complete {
                    header |= FLAG_C;
                }
                w.write_u8(header)?;
                w.write_zint(u64::from(*id))?;
                wire_expr.encode(w)?;
                w.write_zint(u64::from(*distance))?;
            }
            DeclareBody::UndeclareQueryable { id } => {
                w.write_u8(declare_id::UNDECLARE_QUERYABLE)?;
                w.write_zint(u64::from(*id))?;
            }
            DeclareBody::Token { id, wire_expr } => {
                let mut header = declare_id::TOKEN;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                w.write_u8(header)?;
                w.write_zint(u64::from(*id))?;
                wire_expr.encode(w)?;
            }
            DeclareBody::UndeclareToken { id } => {
                w.write_u8(declare_id::UNDECLARE_TOKEN)?;
                w.write_zint(u64::from(*id))?;
            }
            DeclareBody::Final => {
                w.write_u8(declare_id::FINAL)?;
            }
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let header = r.read_u8()?;
        let named = header & FLAG_N != 0;
        let read_rid = |r: &mut Reader<'_>| -> ProtoResult<u16> {
            u16::try_from(r.read_zint()?).map_err(|_| ProtoError::Malformed("rid overflow"))
        };
        let read_eid = |r: &mut Reader<'_>| -> ProtoResult<u32> {
            u32::try_from(r.read_zint()?).map_err(|_| ProtoError::Malformed("entity id overflow"))
        };
        match header & ID_MASK {
            declare_id::KEYEXPR => Ok(DeclareBody::KeyExpr {
                rid: read_rid(r)?,
                wire_expr: WireExpr::decode(r, named)?,
            }),
            declare_id::UNDECLARE_KEYEXPR => Ok(DeclareBody::UndeclareKeyExpr { rid: read_rid(r)? }),
            declare_id::SUBSCRIBER => Ok(DeclareBody::Subscriber {
                id: read_eid(r)?,
                wire_expr: WireExpr::decode(r, named)?,
            }),
            declare_id::UNDECLARE_SUBSCRIBER => {
                Ok(DeclareBody::UndeclareSubscriber { id: read_eid(r)? })
            }
            declare_id::QUERYABLE => Ok(DeclareBody::Queryable {
                id: read_eid(r)?,
                wire_expr: WireExpr::decode(r, named)?,
                complete: header & FLAG_C != 0,
                distance: read_rid(r)?,
            }),
            declare_id::UNDECLARE_QUERYABLE => {
                Ok(DeclareBody::UndeclareQueryable { id: read_eid(r)? })
            }
            declare_id::TOKEN => Ok(DeclareBody::Token {
                id: read_eid(r)?,
                wire_expr: WireExpr::decode(r, named)?,
            }),
            declare_id::UNDECLARE_TOKEN => Ok(DeclareBody::UndeclareToken { id: read_eid(r)? }),
            declare_id::FINAL => Ok(DeclareBody::Final),
            other => Err(ProtoError::UnknownMessage(other)),
        }
    }
}

/// The network message catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Push {
        wire_expr: WireExpr<'static>,
        qos: Priority,
        body: PushBody,
    },
    Request {
        qid: u64,
        wire_expr: WireExpr<'static>,
        target: QueryTarget,
        timeout_ms: Option<u64>,
        body: RequestBody,
    },
    Response {
        qid: u64,
        wire_expr: WireExpr<'static>,
        replier: Option<ZId>,
        body: ResponseBody,
    },
    ResponseFinal {
        qid: u64,
    },
    Declare {
        body: DeclareBody,
    },
    Oam {
        oam_id: u8,
        body: Vec<u8>,
    },
}

impl NetworkMessage {
    pub fn encode(&self, w: &mut Writer) -> ProtoResult<()> {
        match self {
            NetworkMessage::Push {
                wire_expr,
                qos,
                body,
            } => {
                let mut exts = smallvec::SmallVec::<[ZExt; 2]>::new();
                if *qos != Priority::default() {
                    exts.push(ZExt::new(ext_id::QOS, false, vec![*qos as u8]));
                }
                let mut header = id::PUSH;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                if !exts.is_empty() {
                    header |= FLAG_Z;
                }
                w.write_u8(header)?;
                wire_expr.encode(w)?;
                ext::encode(w, &exts)?;
                body.encode(w)?;
            }
            NetworkMessage::Request {
                qid,
                wire_expr,
                target,
                timeout_ms,
                body,
            } => {
                let mut exts = smallvec::SmallVec::<[ZExt; 2]>::new();
                if *target != QueryTarget::default() {
                    exts.push(ZExt::new(ext_id::TARGET, false, vec![target.encode()]));
                }
                if let Some(timeout) = timeout_ms {
                    let mut ew = Writer::unbounded();
                    ew.write_zint(*timeout)?;
                    exts.push(ZExt::new(ext_id::TIMEOUT, false, ew.into_vec()));
                }
                let mut header = id::REQUEST;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                if !exts.is_empty() {
                    header |= FLAG_Z;
                }
                w.write_u8(header)?;
                w.write_zint(*qid)?;
                wire_expr.encode(w)?;
                ext::encode(w, &exts)?;
                body.encode(w)?;
            }
            NetworkMessage::Response {
                qid,
                wire_expr,
                replier,
                body,
            } => {
                let mut exts = smallvec::SmallVec::<[ZExt; 2]>::new();
                if let Some(zid) = replier {
                    let mut ew = Writer::unbounded();
                    zid.encode(&mut ew)?;
                    exts.push(ZExt::new(ext_id::REPLIER_ID, false, ew.into_vec()));
                }
                let mut header = id::RESPONSE;
                if wire_expr.has_suffix() {
                    header |= FLAG_N;
                }
                if !exts.is_empty() {
                    header |= FLAG_Z;
                }
                w.write_u8(header)?;
                w.write_zint(*qid)?;
                wire_expr.encode(w)?;
                ext::encode(w, &exts)?;
                body.encode(w)?;
            }
            NetworkMessage::ResponseFinal { qid } => {
                w.write_u8(id::RESPONSE_FINAL)?;
                w.write_zint(*qid)?;
            }
            NetworkMessage::Declare { body } => {
                w.write_u8(id::DECLARE)?;
                body.encode(w)?;
            }
            NetworkMessage::Oam { oam_id, body } => {
                w.write_u8(id::OAM)?;
                w.write_u8(*oam_id)?;
                w.write_bytes(body)?;
            }
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> ProtoResult<Self> {
        let header = r.read_u8()?;
        let named = header & FLAG_N != 0;
        let z = header & FLAG_Z != 0;
        match header & ID_MASK {
            id::PUSH => {
                let wire_expr = WireExpr::decode(r, named)?;
                let exts = ext::decode_if(r, z)?;
                let mut qos = Priority::default();
                ext::visit(&exts, |e| {
                    if e.id == ext_id::QOS {
                        let b = *e.body.first().ok_or(ProtoError::Malformed("qos ext"))?;
                        qos = Priority::decode(b & 0x07)?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                })?;
                let body = PushBody::decode(r)?;
                Ok(NetworkMessage::Push {
                    wire_expr,
                    qos,
                    body,
                })
            }
            id::REQUEST => {
                let qid = r.read_zint()?;
                let wire_expr = WireExpr::decode(r, named)?;
                let exts = ext::decode_if(r, z)?;
                let mut target = QueryTarget::default();
                let mut timeout_ms = None;
                ext::visit(&exts, |e| match e.id {
                    ext_id::TARGET => {
                        let b = *e.body.first().ok_or(ProtoError::Malformed("target ext"))?;
                        target = QueryTarget::decode(b)?;
                        Ok(true)
                    }
                    ext_id::TIMEOUT => {
                        let mut er = Reader::new(&e.body);
                        timeout_ms = Some(er.read_zint()?);
                        Ok(true)
                    }
                    ext_id::QOS => Ok(true),
                    _ => Ok(false),
                })?;
                let body = RequestBody::decode(r)?;
                Ok(NetworkMessage::Request {
                    qid,
                    wire_expr,
                    target,
                    timeout_ms,
                    body,
                })
            }
            id::RESPONSE => {
                let qid = r.read_zint()?;
                let wire_expr = WireExpr::decode(r, named)?;
                let exts = ext::decode_if(r, z)?;
                let mut replier = None;
                ext::visit(&exts, |e| match e.id {
                    ext_id::REPLIER_ID => {
                        let mut er = Reader::new(&e.body);
                        replier = Some(ZId::decode(&mut er)?);
                        Ok(true)
                    }
                    ext_id::QOS => Ok(true),
                    _ => Ok(false),
                })?;
                let body = ResponseBody::decode(r)?;
                Ok(NetworkMessage::Response {
                    qid,
                    wire_expr,
                    replier,
                    body,
                })
            }
            id::RESPONSE_FINAL => Ok(NetworkMessage::ResponseFinal {
                qid: r.read_zint()?,
            }),
            id::DECLARE => Ok(NetworkMessage::Declare {
                body: DeclareBody::decode(r)?,
            }),
            id::OAM => {
                let oam_id = r.read_u8()?;
                let body = r.read_bytes()?.to_vec();
                Ok(NetworkMessage::Oam { oam_id, body })
            }
            other => Err(ProtoError::UnknownMessage(other)),
        }
    }
}
