//! Datagram links over UDP, unicast and multicast.

use super::{Link, LinkAddr, LinkCaps};
use crate::endpoint::Endpoint;
use crate::error::{TransportError, TransportResult};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Conservative payload bound under the common 1500-byte path MTU.
const UDP_MTU: u16 = 1450;

fn resolve(endpoint: &Endpoint) -> TransportResult<SocketAddr> {
    let port = endpoint
        .port()
        .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
    (endpoint.host(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))
}

/// A connected unicast UDP link.
pub struct UdpUnicastLink {
    socket: UdpSocket,
}

impl UdpUnicastLink {
    pub fn open(endpoint: &Endpoint) -> TransportResult<Self> {
        let remote = resolve(endpoint)?;
        let local: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(remote)?;
        Ok(Self { socket })
    }
}

impl Link for UdpUnicastLink {
    fn caps(&self) -> LinkCaps {
        LinkCaps {
            reliable: false,
            streamed: false,
            multicast: false,
        }
    }

    fn mtu(&self) -> u16 {
        UDP_MTU
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        Ok(self.socket.send(buf)?)
    }

    fn write_all(&self, buf: &[u8]) -> TransportResult<()> {
        let n = self.socket.send(buf)?;
        if n != buf.len() {
            return Err(TransportError::Protocol("short datagram write"));
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        Ok(self.socket.recv(buf)?)
    }

    fn read_exact(&self, buf: &mut [u8]) -> TransportResult<()> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(TransportError::Protocol("short datagram read"));
        }
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> TransportResult<()> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }

    fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// A multicast UDP link: one socket bound to the group for receiving and a
/// second one for sending, so the receive socket never sees a port the
/// group does not own.
pub struct UdpMulticastLink {
    recv: UdpSocket,
    send: UdpSocket,
    group: SocketAddr,
}

impl UdpMulticastLink {
    pub fn open(endpoint: &Endpoint) -> TransportResult<Self> {
        let group = resolve(endpoint)?;
        if !group.ip().is_multicast() {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }
        let iface: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
        match group.ip() {
            IpAddr::V4(group_v4) => {
                let recv = bind_reuse(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    group.port(),
                ))?;
                recv.join_multicast_v4(&group_v4, &iface)?;
                let send = UdpSocket::bind(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    0,
                ))?;
                send.set_multicast_loop_v4(true)?;
                Ok(Self { recv, send, group })
            }
            IpAddr::V6(group_v6) => {
                let recv = bind_reuse(SocketAddr::new(
                    IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                    group.port(),
                ))?;
                recv.join_multicast_v6(&group_v6, 0)?;
                let send = UdpSocket::bind(SocketAddr::new(
                    IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                    0,
                ))?;
                Ok(Self { recv, send, group })
            }
        }
    }

    /// The local address of the sending socket, to recognize our own
    /// looped-back datagrams.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.send.local_addr()?)
    }
}

fn bind_reuse(addr: SocketAddr) -> TransportResult<UdpSocket> {
    // Plain bind; SO_REUSEADDR tuning is left to the platform port.
    Ok(UdpSocket::bind(addr)?)
}

impl Link for UdpMulticastLink {
    fn caps(&self) -> LinkCaps {
        LinkCaps {
            reliable: false,
            streamed: false,
            multicast: true,
        }
    }

    fn mtu(&self) -> u16 {
        UDP_MTU
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        Ok(self.send.send_to(buf, self.group)?)
    }

    fn write_all(&self, buf: &[u8]) -> TransportResult<()> {
        let n = self.write(buf)?;
        if n != buf.len() {
            return Err(TransportError::Protocol("short datagram write"));
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        Ok(self.recv.recv(buf)?)
    }

    fn read_exact(&self, buf: &mut [u8]) -> TransportResult<()> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(TransportError::Protocol("short datagram read"));
        }
        Ok(())
    }

    fn read_from(&self, buf: &mut [u8]) -> TransportResult<(usize, LinkAddr)> {
        let (n, addr) = self.recv.recv_from(buf)?;
        Ok((n, LinkAddr::Socket(addr)))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> TransportResult<()> {
        Ok(self.recv.set_read_timeout(timeout)?)
    }

    fn close(&self) -> TransportResult<()> {
        if let IpAddr::V4(group) = self.group.ip() {
            let _ = self
                .recv
                .leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED);
        }
        Ok(())
    }
}
