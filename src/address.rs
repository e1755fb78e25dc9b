//! Wire-level peer addresses (spec §6: "Address wire form").
//!
//! Mirrors `src/address.cpp`'s constructor set: an address can be built
//! from a host/port pair or parsed from a single `host:port` string.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A peer address: either a concrete IPv4/IPv6 socket address, or the
/// null address (used as a placeholder in the rendezvous meeting point,
/// see `session::rendezvous`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Null,
    V4(SocketAddr),
    V6(SocketAddr),
}

impl Address {
    /// Builds an address from a host string and numeric port. Accepts a
    /// dotted-quad/bracketed-v6 literal; does not perform DNS resolution
    /// (that belongs to the caller, exactly as in the original, where
    /// `Address` is a pure value type and resolution happens in
    /// `Address::resolve`, which we do not reproduce as it is
    /// out-of-scope plumbing).
    pub fn new(host: &str, port: u16) -> Option<Self> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Some(Self::V4(SocketAddr::new(IpAddr::V4(ip), port))),
            Ok(IpAddr::V6(ip)) => Some(Self::V6(SocketAddr::new(IpAddr::V6(ip), port))),
            Err(_) => None,
        }
    }

    /// Parses the text wire form `host:port` (spec §6).
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix('[') {
            // [v6]:port
            let (host, port) = rest.split_once("]:")?;
            let port: u16 = port.parse().ok()?;
            return Self::new(host, port);
        }
        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Self::new(host, port)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Null => None,
            Self::V4(a) | Self::V6(a) => Some(*a),
        }
    }

    /// Binary wire form: 1-byte family tag (`4`, `16`, or `0` for null),
    /// N address bytes in network order, 2-byte port in network order.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Null => vec![0u8],
            Self::V4(addr) => {
                let mut out = vec![4u8];
                if let IpAddr::V4(ip) = addr.ip() {
                    out.extend_from_slice(&ip.octets());
                }
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Self::V6(addr) => {
                let mut out = vec![16u8];
                if let IpAddr::V6(ip) = addr.ip() {
                    out.extend_from_slice(&ip.octets());
                }
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
        }
    }

    /// Parses the binary wire form produced by [`Address::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let (&tag, rest) = buf.split_first()?;
        match tag {
            0 => Some(Self::Null),
            4 => {
                if rest.len() != 6 {
                    return None;
                }
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Some(Self::V4(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            16 => {
                if rest.len() != 18 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                Some(Self::V6(SocketAddr::new(IpAddr::V6(ip), port)))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4(addr),
            SocketAddr::V6(_) => Self::V6(addr),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::V4(a) => write!(f, "{}", a),
            Self::V6(a) => write!(f, "{}", a),
        }
    }
}
