// SPDX-License-Identifier: MIT
//! Address families, socket addresses, and name resolution helpers.
//!
//! The wire address model is a tagged union over unspecified, IPv4, IPv6,
//! Unix-path, and proxy-hostname addresses. The proxy variant carries a
//! host + port the client wants resolved on this side of the bus.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use serde::{Deserialize, Serialize};

use crate::err::{Error, Result};

// ─── Families and socket kinds ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Unspec,
    Unix,
    Inet,
    Inet6,
    /// Hostname to be resolved by the proxy.
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketKind {
    Stream,
    Dgram,
    Raw,
    SeqPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Unspec,
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

/// Socket flag bits carried in [`SocketProps::flags`].
pub mod flags {
    /// Bind + listen instead of connect.
    pub const PASSIVE: u32 = 0x1;
    /// Peer is an in-process server reached over a local pair.
    pub const INTERNAL: u32 = 0x2;
}

// ─── Socket address ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SocketAddress {
    Unspec,
    Inet {
        addr: [u8; 4],
        port: u16,
    },
    Inet6 {
        addr: [u8; 16],
        port: u16,
        flow: u32,
        scope: u32,
    },
    Unix {
        path: String,
    },
    Proxy {
        host: String,
        port: u16,
        flags: u32,
    },
}

impl Default for SocketAddress {
    fn default() -> Self {
        SocketAddress::Unspec
    }
}

impl SocketAddress {
    pub fn family(&self) -> Family {
        match self {
            SocketAddress::Unspec => Family::Unspec,
            SocketAddress::Inet { .. } => Family::Inet,
            SocketAddress::Inet6 { .. } => Family::Inet6,
            SocketAddress::Unix { .. } => Family::Unix,
            SocketAddress::Proxy { .. } => Family::Proxy,
        }
    }

    /// Destination port, if the family has one.
    pub fn port(&self) -> Option<u16> {
        match self {
            SocketAddress::Inet { port, .. }
            | SocketAddress::Inet6 { port, .. }
            | SocketAddress::Proxy { port, .. } => Some(*port),
            _ => None,
        }
    }

    pub fn from_std(sa: SocketAddr) -> SocketAddress {
        match sa {
            SocketAddr::V4(v4) => SocketAddress::Inet {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => SocketAddress::Inet6 {
                addr: v6.ip().octets(),
                port: v6.port(),
                flow: v6.flowinfo(),
                scope: v6.scope_id(),
            },
        }
    }

    /// Concrete `SocketAddr`, for inet/inet6 only.
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self {
            SocketAddress::Inet { addr, port } => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(*addr),
                *port,
            ))),
            SocketAddress::Inet6 {
                addr,
                port,
                flow,
                scope,
            } => Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(*addr),
                *port,
                *flow,
                *scope,
            ))),
            _ => None,
        }
    }

    /// Presentation form of the host part (`ntop`).
    pub fn host_string(&self) -> Result<String> {
        match self {
            SocketAddress::Inet { addr, .. } => Ok(Ipv4Addr::from(*addr).to_string()),
            SocketAddress::Inet6 { addr, .. } => Ok(Ipv6Addr::from(*addr).to_string()),
            SocketAddress::Proxy { host, .. } => Ok(host.clone()),
            SocketAddress::Unix { path } => Ok(path.clone()),
            SocketAddress::Unspec => Err(Error::AddressFamily),
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unspec => write!(f, "unspec"),
            SocketAddress::Inet { addr, port } => {
                write!(f, "{}:{}", Ipv4Addr::from(*addr), port)
            }
            SocketAddress::Inet6 { addr, port, .. } => {
                write!(f, "[{}]:{}", Ipv6Addr::from(*addr), port)
            }
            SocketAddress::Unix { path } => write!(f, "unix:{path}"),
            SocketAddress::Proxy { host, port, .. } => write!(f, "{host}:{port}"),
        }
    }
}

/// Parse a literal IPv4/IPv6 address (`pton`); no name resolution.
pub fn pton(s: &str) -> Result<SocketAddress> {
    let ip: IpAddr = s.parse().map_err(|_| Error::InvalidFormat)?;
    Ok(SocketAddress::from_std(SocketAddr::new(ip, 0)))
}

// ─── Resolution ───────────────────────────────────────────────────────────────

/// Resolve `host:port` to concrete addresses, optionally restricted to one
/// family. Empty result maps to [`Error::NoHost`].
pub async fn resolve(host: &str, port: u16, family: Family) -> Result<Vec<SocketAddress>> {
    let mut out = Vec::new();
    let iter = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| Error::HostUnknown)?;
    for sa in iter {
        let keep = match family {
            Family::Inet => sa.is_ipv4(),
            Family::Inet6 => sa.is_ipv6(),
            _ => true,
        };
        if keep {
            out.push(SocketAddress::from_std(sa));
        }
    }
    if out.is_empty() {
        return Err(Error::NoHost);
    }
    Ok(out)
}

/// Resolve a wire address to the list of concrete candidates tried at open.
pub async fn resolve_address(address: &SocketAddress) -> Result<Vec<SocketAddress>> {
    match address {
        SocketAddress::Inet { .. } | SocketAddress::Inet6 { .. } => Ok(vec![address.clone()]),
        SocketAddress::Unix { .. } => Ok(vec![address.clone()]),
        SocketAddress::Proxy { host, port, .. } => {
            if host.is_empty() {
                return Err(Error::InvalidFormat);
            }
            resolve(host, *port, Family::Unspec).await
        }
        SocketAddress::Unspec => Err(Error::NoAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_round_trip() {
        let sa: SocketAddr = "192.0.2.7:8080".parse().unwrap();
        let wire = SocketAddress::from_std(sa);
        assert_eq!(wire.to_std(), Some(sa));
        assert_eq!(wire.family(), Family::Inet);
        assert_eq!(wire.port(), Some(8080));

        let sa6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let wire6 = SocketAddress::from_std(sa6);
        assert_eq!(wire6.to_std(), Some(sa6));
        assert_eq!(wire6.family(), Family::Inet6);
    }

    #[test]
    fn test_pton_rejects_names() {
        assert!(pton("10.1.2.3").is_ok());
        assert!(pton("::1").is_ok());
        assert_eq!(pton("localhost"), Err(Error::InvalidFormat));
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let addrs = resolve("127.0.0.1", 80, Family::Inet).await.unwrap();
        assert_eq!(
            addrs[0],
            SocketAddress::Inet {
                addr: [127, 0, 0, 1],
                port: 80
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_address_rejects_empty_proxy_host() {
        let addr = SocketAddress::Proxy {
            host: String::new(),
            port: 80,
            flags: 0,
        };
        assert_eq!(resolve_address(&addr).await, Err(Error::InvalidFormat));
    }
}
