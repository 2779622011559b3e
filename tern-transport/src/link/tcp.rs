//! Reliable streamed link over TCP.

use super::{Link, LinkCaps};
use crate::endpoint::Endpoint;
use crate::error::{TransportError, TransportResult};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    pub fn open(endpoint: &Endpoint, timeout: Duration) -> TransportResult<Self> {
        let addr = (endpoint.host(), endpoint.port().ok_or_else(|| {
            TransportError::InvalidEndpoint(endpoint.to_string())
        })?)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Link for TcpLink {
    fn caps(&self) -> LinkCaps {
        LinkCaps {
            reliable: true,
            streamed: true,
            multicast: false,
        }
    }

    fn mtu(&self) -> u16 {
        u16::MAX
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        Ok((&self.stream).write(buf)?)
    }

    fn write_all(&self, buf: &[u8]) -> TransportResult<()> {
        Ok((&self.stream).write_all(buf)?)
    }

    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let n = (&self.stream).read(buf)?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }

    fn read_exact(&self, buf: &mut [u8]) -> TransportResult<()> {
        (&self.stream)
            .read_exact(buf)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
                _ => TransportError::Io(e),
            })
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> TransportResult<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    fn close(&self) -> TransportResult<()> {
        // Both halves, so a blocked reader wakes with EOF.
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}
