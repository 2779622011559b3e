//! The pending-query registry: outstanding `get`s, reply consolidation
//! and deadlines.

use crate::types::Reply;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tern_proto::core::{ConsolidationMode, Timestamp, ZId};
use tern_transport::FlatMap;
use tracing::debug;

pub(crate) type ReplyCallback = Arc<dyn Fn(Reply) + Send + Sync>;
pub(crate) type DropCallback = Box<dyn FnOnce() + Send>;

/// Everything to run outside the registry lock when a query terminates:
/// buffered replies in key order, then the drop callback.
pub(crate) struct QueryFinish {
    pub reply_cb: ReplyCallback,
    pub flush: Vec<Reply>,
    pub drop_cb: Option<DropCallback>,
}

struct PendingQuery {
    consolidation: ConsolidationMode,
    deadline: Instant,
    reply_cb: ReplyCallback,
    drop_cb: Option<DropCallback>,
    /// Monotonic mode: newest timestamp seen per (replier, key).
    seen: FlatMap<(Option<ZId>, String), Timestamp>,
    /// Latest mode: the surviving reply per key, flushed at the end.
    latest: BTreeMap<String, Reply>,
}

/// Ordering key for consolidation; replies without a timestamp sort first,
/// so any stamped reply supersedes them.
fn stamp(reply: &Reply) -> Option<Timestamp> {
    match reply {
        Reply::Ok { sample, .. } => sample.timestamp,
        Reply::Err { .. } => None,
    }
}

#[derive(Default)]
pub(crate) struct QueryRegistry {
    next_qid: u64,
    pending: FlatMap<u64, PendingQuery>,
}

impl QueryRegistry {
    pub fn create(
        &mut self,
        consolidation: ConsolidationMode,
        deadline: Instant,
        reply_cb: ReplyCallback,
        drop_cb: DropCallback,
    ) -> u64 {
        self.next_qid = self.next_qid.wrapping_add(1);
        let qid = self.next_qid;
        self.pending.insert(
            qid,
            PendingQuery {
                consolidation,
                deadline,
                reply_cb,
                drop_cb: Some(drop_cb),
                seen: FlatMap::new(),
                latest: BTreeMap::new(),
            },
        );
        qid
    }

    pub fn is_pending(&self, qid: u64) -> bool {
        self.pending.contains_key(&qid)
    }

    /// Apply the consolidation policy to one reply. Returns the callback
    /// to invoke (outside the lock) when the policy forwards it.
    pub fn on_reply(
        &mut self,
        qid: u64,
        keyexpr: &str,
        replier: Option<ZId>,
        reply: Reply,
    ) -> Option<(ReplyCallback, Reply)> {
        let Some(pending) = self.pending.get_mut(&qid) else {
            debug!(qid, "reply for unknown or finished query");
            return None;
        };
        // Error replies are never consolidated away.
        if matches!(reply, Reply::Err { .. }) {
            return Some((pending.reply_cb.clone(), reply));
        }
        match pending.consolidation {
            ConsolidationMode::None => Some((pending.reply_cb.clone(), reply)),
            ConsolidationMode::Monotonic => {
                let key = (replier, keyexpr.to_string());
                let ts = stamp(&reply);
                if let Some(seen) = pending.seen.get(&key) {
                    if ts.map_or(true, |ts| ts <= *seen) {
                        debug!(qid, keyexpr, "dropping non-monotonic reply");
                        return None;
                    }
                }
                if let Some(ts) = ts {
                    pending.seen.insert(key, ts);
                }
                Some((pending.reply_cb.clone(), reply))
            }
            ConsolidationMode::Latest => {
                match pending.latest.get(keyexpr) {
                    Some(prior) if stamp(&reply) < stamp(prior) => {
                        debug!(qid, keyexpr, "keeping newer buffered reply");
                    }
                    _ => {
                        pending.latest.insert(keyexpr.to_string(), reply);
                    }
                }
                None
            }
        }
    }

    /// Terminate `qid` (final reply received or session closing).
    pub fn finish(&mut self, qid: u64) -> Option<QueryFinish> {
        let PendingQuery {
            reply_cb,
            drop_cb,
            latest,
            ..
        } = self.pending.remove(&qid)?;
        Some(QueryFinish {
            reply_cb,
            flush: latest.into_values().collect(),
            drop_cb,
        })
    }

    /// Collect every query whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<QueryFinish> {
        let qids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(qid, _)| *qid)
            .collect();
        qids.into_iter().filter_map(|qid| self.finish(qid)).collect()
    }

    /// Terminate everything, for session close.
    pub fn drain(&mut self) -> Vec<QueryFinish> {
        let qids: Vec<u64> = self.pending.iter().map(|(qid, _)| *qid).collect();
        qids.into_iter().filter_map(|qid| self.finish(qid)).collect()
    }
}
