//! Endpoint parsing: `proto/address[#option=value]`.
//!
//! Accepted forms are `tcp/host:port`, `udp/host:port` and
//! `udp/host:port#iface=name`. IPv6 addresses use the bracket form
//! `tcp/[::1]:7447`.

use crate::error::{TransportError, TransportResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub address: String,
    pub iface: Option<String>,
}

impl Endpoint {
    pub fn parse(s: &str) -> TransportResult<Self> {
        let (proto, rest) = s
            .split_once('/')
            .ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))?;
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            // Known link kinds this build does not carry are reported as
            // unavailable rather than malformed.
            "serial" | "ble" | "reth" | "ws" | "tls" => {
                return Err(TransportError::NotAvailable(s.to_string()))
            }
            _ => return Err(TransportError::InvalidEndpoint(s.to_string())),
        };
        let (address, options) = match rest.split_once('#') {
            Some((addr, opts)) => (addr, Some(opts)),
            None => (rest, None),
        };
        if address.is_empty() || !has_port(address) {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        let mut iface = None;
        if let Some(options) = options {
            for opt in options.split(';').filter(|o| !o.is_empty()) {
                match opt.split_once('=') {
                    Some(("iface", value)) if !value.is_empty() => {
                        iface = Some(value.to_string());
                    }
                    _ => return Err(TransportError::InvalidEndpoint(s.to_string())),
                }
            }
        }
        Ok(Self {
            protocol,
            address: address.to_string(),
            iface,
        })
    }

    /// Host part, brackets stripped for IPv6.
    pub fn host(&self) -> &str {
        let host = match self.address.rfind(':') {
            Some(idx) => &self.address[..idx],
            None => &self.address,
        };
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    pub fn port(&self) -> Option<u16> {
        self.address.rsplit_once(':')?.1.parse().ok()
    }

    /// Whether the address names an IPv4/IPv6 multicast group.
    pub fn is_multicast(&self) -> bool {
        self.host()
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_multicast())
            .unwrap_or(false)
    }
}

fn has_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.address)?;
        if let Some(iface) = &self.iface {
            write!(f, "#iface={iface}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        let ep = Endpoint::parse("tcp/127.0.0.1:7447").unwrap();
        assert_eq!(ep.protocol, Protocol::Tcp);
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), Some(7447));
        assert!(!ep.is_multicast());

        let ep = Endpoint::parse("udp/224.0.0.224:7446#iface=lo").unwrap();
        assert_eq!(ep.protocol, Protocol::Udp);
        assert_eq!(ep.iface.as_deref(), Some("lo"));
        assert!(ep.is_multicast());
        assert_eq!(ep.to_string(), "udp/224.0.0.224:7446#iface=lo");

        let ep = Endpoint::parse("tcp/[::1]:7447").unwrap();
        assert_eq!(ep.host(), "::1");
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "serial/ttyUSB0",
            "tcp/",
            "tcp/hostonly",
            "tcp/host:notaport",
            "udp/224.0.0.224:7446#ttl=3",
            "noproto",
        ] {
            assert!(Endpoint::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
