//! Byte links: the lowest layer the transports sit on.
//!
//! A link moves opaque batches of bytes and knows nothing about message
//! semantics. Streamed links frame each batch with a 16-bit little-endian
//! length prefix; datagram links rely on the datagram boundary.

pub mod mem;
pub mod tcp;
pub mod udp;

use crate::error::{TransportError, TransportResult};
use std::net::SocketAddr;

pub use mem::{MemHub, MemLink};
pub use tcp::TcpLink;
pub use udp::{UdpMulticastLink, UdpUnicastLink};

/// What a link can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCaps {
    pub reliable: bool,
    pub streamed: bool,
    pub multicast: bool,
}

/// Where a datagram came from, for multicast peer bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkAddr {
    /// Unicast links have exactly one peer.
    None,
    Socket(SocketAddr),
    /// In-memory test links are numbered by the hub.
    Mem(u32),
}

impl std::fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkAddr::None => f.write_str("-"),
            LinkAddr::Socket(addr) => write!(f, "{addr}"),
            LinkAddr::Mem(id) => write!(f, "mem:{id}"),
        }
    }
}

pub trait Link: Send + Sync {
    fn caps(&self) -> LinkCaps;
    /// Largest batch this link can carry in one write.
    fn mtu(&self) -> u16;
    /// Write some bytes; streamed links may write fewer than requested.
    fn write(&self, buf: &[u8]) -> TransportResult<usize>;
    fn write_all(&self, buf: &[u8]) -> TransportResult<()>;
    /// Read some bytes (a whole datagram on datagram links).
    fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;
    fn read_exact(&self, buf: &mut [u8]) -> TransportResult<()>;
    /// Like `read`, also reporting the origin on multicast links.
    fn read_from(&self, buf: &mut [u8]) -> TransportResult<(usize, LinkAddr)> {
        self.read(buf).map(|n| (n, LinkAddr::None))
    }
    /// Bound on blocking reads; `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> TransportResult<()>;
    /// Close the link, unblocking any reader.
    fn close(&self) -> TransportResult<()>;
}

/// Write one batch, honoring the streamed length-prefix rule.
pub fn write_batch(link: &dyn Link, batch: &[u8]) -> TransportResult<()> {
    if batch.len() > u16::MAX as usize {
        return Err(TransportError::Protocol("batch exceeds length prefix"));
    }
    if link.caps().streamed {
        let prefix = (batch.len() as u16).to_le_bytes();
        link.write_all(&prefix)?;
    }
    link.write_all(batch)
}

/// Read one batch into `buf`, returning its length and origin.
pub fn read_batch(link: &dyn Link, buf: &mut [u8]) -> TransportResult<(usize, LinkAddr)> {
    if link.caps().streamed {
        let mut prefix = [0u8; 2];
        link.read_exact(&mut prefix)?;
        let len = u16::from_le_bytes(prefix) as usize;
        if len > buf.len() {
            return Err(TransportError::Protocol("batch larger than receive buffer"));
        }
        link.read_exact(&mut buf[..len])?;
        Ok((len, LinkAddr::None))
    } else {
        link.read_from(buf)
    }
}
