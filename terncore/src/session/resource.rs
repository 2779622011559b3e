//! Resource tables: cached key-expression prefixes, local and per-peer.

use crate::error::{TernError, TernResult};
use crate::keyexpr;
use tern_proto::core::WireExpr;
use tern_transport::{FlatMap, PeerId};
use tracing::debug;

#[derive(Debug)]
struct Resource {
    keyexpr: String,
    refcount: usize,
    /// The RID this entry was registered on top of, whose reference it
    /// holds.
    base: Option<u16>,
}

/// One RID space: the local one, or the remote one of a given origin.
#[derive(Debug, Default)]
pub struct ResourceSpace {
    entries: FlatMap<u16, Resource>,
}

impl ResourceSpace {
    /// Resolve a wire expression against this space into a canonical key.
    pub fn expand(&self, wire_expr: &WireExpr<'_>) -> TernResult<String> {
        if wire_expr.scope == 0 {
            return keyexpr::canonicalize(&wire_expr.suffix);
        }
        let base = self.entries.get(&wire_expr.scope).ok_or_else(|| {
            TernError::Protocol(format!("unknown resource id {}", wire_expr.scope))
        })?;
        if wire_expr.suffix.is_empty() {
            Ok(base.keyexpr.clone())
        } else {
            keyexpr::canonicalize(&format!("{}/{}", base.keyexpr, wire_expr.suffix))
        }
    }

    /// Record `rid` as naming the expansion of `wire_expr`. A suffixed
    /// registration holds a reference on its base until unregistered.
    pub fn register(&mut self, rid: u16, wire_expr: &WireExpr<'_>) -> TernResult<String> {
        let full = self.expand(wire_expr)?;
        if let Some(existing) = self.entries.get_mut(&rid) {
            if existing.keyexpr != full {
                return Err(TernError::Protocol(format!(
                    "resource id {rid} redeclared with a different key"
                )));
            }
            existing.refcount += 1;
        } else {
            let base = (wire_expr.scope != 0).then_some(wire_expr.scope);
            if let Some(base) = base {
                if let Some(entry) = self.entries.get_mut(&base) {
                    entry.refcount += 1;
                }
            }
            self.entries.insert(
                rid,
                Resource {
                    keyexpr: full.clone(),
                    refcount: 1,
                    base,
                },
            );
        }
        Ok(full)
    }

    /// Drop one reference; the entry disappears at zero, releasing its
    /// base in turn.
    pub fn unregister(&mut self, rid: u16) {
        let Some(resource) = self.entries.get_mut(&rid) else {
            debug!(rid, "undeclare for unknown resource id");
            return;
        };
        resource.refcount -= 1;
        if resource.refcount > 0 {
            return;
        }
        let base = resource.base;
        self.entries.remove(&rid);
        if let Some(base) = base {
            self.unregister(base);
        }
    }

    pub fn contains(&self, rid: u16) -> bool {
        self.entries.contains_key(&rid)
    }

    /// Every registered (rid, key) pair, for re-announcement.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &str)> {
        self.entries
            .iter()
            .map(|(rid, resource)| (*rid, resource.keyexpr.as_str()))
    }

    /// The RID already naming `keyexpr`, if any.
    pub fn rid_of(&self, keyexpr: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, r)| r.keyexpr == keyexpr)
            .map(|(rid, _)| *rid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All resource state of a session: one local space, one remote space per
/// origin. The unicast router is the `None` origin.
#[derive(Debug, Default)]
pub struct ResourceTables {
    pub local: ResourceSpace,
    remote: FlatMap<Option<PeerId>, ResourceSpace>,
    next_rid: u16,
}

impl ResourceTables {
    /// A fresh, monotonically issued local RID.
    pub fn next_rid(&mut self) -> u16 {
        self.next_rid = self.next_rid.wrapping_add(1).max(1);
        self.next_rid
    }

    pub fn remote(&mut self, peer: Option<PeerId>) -> &mut ResourceSpace {
        if !self.remote.contains_key(&peer) {
            self.remote.insert(peer, ResourceSpace::default());
        }
        self.remote.get_mut(&peer).expect("just inserted")
    }

    /// Expand an inbound wire expression within the announcing origin's
    /// RID space.
    pub fn expand_remote(
        &self,
        wire_expr: &WireExpr<'_>,
        peer: Option<PeerId>,
    ) -> TernResult<String> {
        if wire_expr.scope == 0 {
            return keyexpr::canonicalize(&wire_expr.suffix);
        }
        match self.remote.get(&peer) {
            Some(space) => space.expand(wire_expr),
            None => Err(TernError::Protocol(format!(
                "resource id {} from unknown origin",
                wire_expr.scope
            ))),
        }
    }

    /// Forget everything a departed peer declared.
    pub fn drop_peer(&mut self, peer: PeerId) {
        self.remote.remove(&Some(peer));
    }
}
