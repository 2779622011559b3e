//! In-memory links for deterministic tests.
//!
//! A [`MemHub`] is a lossless broadcast domain: every batch written by one
//! member is delivered to every other member, tagged with the writer's id.
//! [`MemHub::pair`] produces a two-member hub that behaves like a reliable
//! point-to-point link.

use super::{Link, LinkAddr, LinkCaps};
use crate::error::{TransportError, TransportResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<(Vec<u8>, u32)>>,
    ready: Condvar,
    closed: AtomicBool,
}

struct HubInner {
    members: Mutex<Vec<(u32, Arc<Inbox>)>>,
    multicast: bool,
}

#[derive(Clone)]
pub struct MemHub {
    inner: Arc<HubInner>,
    next_id: Arc<Mutex<u32>>,
}

impl MemHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                members: Mutex::new(Vec::new()),
                multicast: true,
            }),
            next_id: Arc::new(Mutex::new(0)),
        }
    }

    /// A reliable point-to-point pair.
    pub fn pair() -> (Arc<MemLink>, Arc<MemLink>) {
        let hub = Self {
            inner: Arc::new(HubInner {
                members: Mutex::new(Vec::new()),
                multicast: false,
            }),
            next_id: Arc::new(Mutex::new(0)),
        };
        (hub.attach(), hub.attach())
    }

    /// Join the broadcast domain with a fresh member id.
    pub fn attach(&self) -> Arc<MemLink> {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let inbox = Arc::new(Inbox::default());
        self.inner.members.lock().push((id, inbox.clone()));
        Arc::new(MemLink {
            hub: self.inner.clone(),
            id,
            inbox,
            read_timeout: Mutex::new(None),
        })
    }
}

impl Default for MemHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemLink {
    hub: Arc<HubInner>,
    id: u32,
    inbox: Arc<Inbox>,
    read_timeout: Mutex<Option<Duration>>,
}

impl MemLink {
    pub fn member_id(&self) -> u32 {
        self.id
    }

    fn pop(&self, buf: &mut [u8]) -> TransportResult<(usize, LinkAddr)> {
        let timeout = *self.read_timeout.lock();
        let mut queue = self.inbox.queue.lock();
        loop {
            if let Some((batch, from)) = queue.pop_front() {
                if batch.len() > buf.len() {
                    return Err(TransportError::Protocol("batch larger than receive buffer"));
                }
                buf[..batch.len()].copy_from_slice(&batch);
                return Ok((batch.len(), LinkAddr::Mem(from)));
            }
            if self.inbox.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            match timeout {
                Some(t) => {
                    if self.inbox.ready.wait_for(&mut queue, t).timed_out() {
                        return Err(TransportError::Timeout);
                    }
                }
                None => self.inbox.ready.wait(&mut queue),
            }
        }
    }
}

impl Link for MemLink {
    fn caps(&self) -> LinkCaps {
        LinkCaps {
            // Nothing is ever dropped or reordered in memory.
            reliable: !self.hub.multicast,
            streamed: false,
            multicast: self.hub.multicast,
        }
    }

    fn mtu(&self) -> u16 {
        u16::MAX
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        if self.inbox.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let members = self.hub.members.lock();
        for (id, inbox) in members.iter() {
            if *id == self.id || inbox.closed.load(Ordering::Acquire) {
                continue;
            }
            inbox.queue.lock().push_back((buf.to_vec(), self.id));
            inbox.ready.notify_one();
        }
        Ok(buf.len())
    }

    fn write_all(&self, buf: &[u8]) -> TransportResult<()> {
        self.write(buf).map(|_| ())
    }

    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        self.pop(buf).map(|(n, _)| n)
    }

    fn read_exact(&self, buf: &mut [u8]) -> TransportResult<()> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(TransportError::Protocol("short datagram read"));
        }
        Ok(())
    }

    fn read_from(&self, buf: &mut [u8]) -> TransportResult<(usize, LinkAddr)> {
        self.pop(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> TransportResult<()> {
        *self.read_timeout.lock() = timeout;
        Ok(())
    }

    fn close(&self) -> TransportResult<()> {
        self.inbox.closed.store(true, Ordering::Release);
        self.inbox.ready.notify_all();
        Ok(())
    }
}
