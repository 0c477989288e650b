//! Subnet and port-range probe scanner.
//!
//! A scan iterates candidate `address:port` targets — every host of the
//! local IPv4 subnets, a given subnet, or a port range on one host — and
//! probes each with a nonblocking TCP connect under a short timeout, at
//! most [`MAX_PROBES`] in flight. Hits are reported through a channel with
//! an optional reverse-DNS name; exhaustion is reported exactly once as
//! [`ScanEvent::Done`], even when the scan is dropped early.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace, warn};

use crate::err::{Error, Result};
use crate::pal::net::SocketAddress;

/// Concurrent probe ceiling.
pub const MAX_PROBES: usize = 1024;
/// Per-probe connect timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(600);

/// Scan behavior flags.
pub mod flags {
    /// Consult the neighbor cache only; no probes on the wire.
    pub const CACHE_ONLY: u32 = 0x1;
    /// Skip the reverse-DNS lookup on hits.
    pub const NO_NAME_LOOKUP: u32 = 0x2;
}

/// What to sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    /// Every host of a /24, on one port. `None` sweeps each local subnet.
    Subnet {
        base: Option<Ipv4Addr>,
        port: u16,
    },
    /// An inclusive port range on one host.
    PortRange {
        addr: IpAddr,
        from: u16,
        to: u16,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Found {
        address: SocketAddress,
        name: Option<String>,
    },
    /// The search space is exhausted; sent exactly once, last.
    Done,
}

pub struct Scanner {
    probe_timeout: Duration,
    max_probes: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner {
            probe_timeout: PROBE_TIMEOUT,
            max_probes: MAX_PROBES,
        }
    }
}

impl Scanner {
    pub fn new() -> Scanner {
        Scanner::default()
    }

    /// Start a scan; results arrive on the returned channel. Dropping the
    /// receiver cancels outstanding probes.
    pub fn start(&self, target: ScanTarget, scan_flags: u32) -> mpsc::Receiver<ScanEvent> {
        let (tx, rx) = mpsc::channel(64);
        let probe_timeout = self.probe_timeout;
        let max_probes = self.max_probes;
        tokio::spawn(async move {
            if scan_flags & flags::CACHE_ONLY != 0 {
                scan_neighbor_cache(&target, &tx).await;
            } else {
                run_scan(target, scan_flags, probe_timeout, max_probes, &tx).await;
            }
            // Exactly once, even after send failures above.
            let _ = tx.send(ScanEvent::Done).await;
        });
        rx
    }
}

async fn run_scan(
    target: ScanTarget,
    scan_flags: u32,
    probe_timeout: Duration,
    max_probes: usize,
    tx: &mpsc::Sender<ScanEvent>,
) {
    let candidates = match expand(&target) {
        Ok(c) => c,
        Err(e) => {
            warn!(err = %e, "scan target expansion failed");
            return;
        }
    };
    debug!(count = candidates.len(), "scan started");

    let limit = Arc::new(Semaphore::new(max_probes));
    let mut probes = Vec::with_capacity(candidates.len());
    for sa in candidates {
        let permit = match limit.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let tx = tx.clone();
        probes.push(tokio::spawn(async move {
            let _permit = permit;
            if !probe(sa, probe_timeout).await {
                return;
            }
            let name = if scan_flags & flags::NO_NAME_LOOKUP == 0 {
                reverse_lookup(sa.ip()).await
            } else {
                None
            };
            trace!(addr = %sa, "scan hit");
            let _ = tx
                .send(ScanEvent::Found {
                    address: SocketAddress::from_std(sa),
                    name,
                })
                .await;
        }));
    }
    for probe in probes {
        let _ = probe.await;
    }
}

/// One connect probe; open or refused-with-reset both prove a live host,
/// but only an accepted connection counts as a hit.
async fn probe(sa: SocketAddr, probe_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(probe_timeout, TcpStream::connect(sa)).await,
        Ok(Ok(_))
    )
}

async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf().ok()?;
    let response = resolver.reverse_lookup(ip).await.ok()?;
    response.iter().next().map(|name| name.to_string())
}

fn expand(target: &ScanTarget) -> Result<Vec<SocketAddr>> {
    match target {
        ScanTarget::PortRange { addr, from, to } => {
            if from > to {
                return Err(Error::Arg);
            }
            Ok((*from..=*to).map(|p| SocketAddr::new(*addr, p)).collect())
        }
        ScanTarget::Subnet { base, port } => {
            let bases = match base {
                Some(b) => vec![*b],
                None => local_subnets()?,
            };
            let mut out = Vec::new();
            for b in bases {
                let octets = b.octets();
                for host in 1u8..=254 {
                    out.push(SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], host)),
                        *port,
                    ));
                }
            }
            Ok(out)
        }
    }
}

/// The /24 of every non-loopback local IPv4 interface.
fn local_subnets() -> Result<Vec<Ipv4Addr>> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|_| Error::Network)?;
    let mut out = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if !v4.is_loopback() {
                let o = v4.octets();
                let base = Ipv4Addr::new(o[0], o[1], o[2], 0);
                if !out.contains(&base) {
                    out.push(base);
                }
            }
        }
    }
    if out.is_empty() {
        return Err(Error::NoAddress);
    }
    Ok(out)
}

/// Cache-only sweep: match the kernel neighbor table against the target
/// instead of probing. Linux exposes it in /proc; elsewhere this finds
/// nothing.
async fn scan_neighbor_cache(target: &ScanTarget, tx: &mpsc::Sender<ScanEvent>) {
    #[cfg(target_os = "linux")]
    {
        let Ok(arp) = tokio::fs::read_to_string("/proc/net/arp").await else {
            return;
        };
        let port = match target {
            ScanTarget::Subnet { port, .. } => *port,
            ScanTarget::PortRange { from, .. } => *from,
        };
        for line in arp.lines().skip(1) {
            let Some(ip) = line.split_whitespace().next() else { continue };
            let Ok(v4) = ip.parse::<Ipv4Addr>() else { continue };
            let keep = match target {
                ScanTarget::Subnet { base: Some(b), .. } => {
                    v4.octets()[..3] == b.octets()[..3]
                }
                ScanTarget::Subnet { base: None, .. } => true,
                ScanTarget::PortRange { addr, .. } => IpAddr::V4(v4) == *addr,
            };
            if keep {
                let _ = tx
                    .send(ScanEvent::Found {
                        address: SocketAddress::Inet {
                            addr: v4.octets(),
                            port,
                        },
                        name: None,
                    })
                    .await;
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (target, tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_port_range_scan_finds_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let scanner = Scanner::new();
        let mut rx = scanner.start(
            ScanTarget::PortRange {
                addr: "127.0.0.1".parse().unwrap(),
                from: port,
                to: port,
            },
            flags::NO_NAME_LOOKUP,
        );

        let mut found = Vec::new();
        while let Some(ev) = rx.recv().await {
            match ev {
                ScanEvent::Found { address, .. } => found.push(address),
                ScanEvent::Done => break,
            }
        }
        assert_eq!(
            found,
            vec![SocketAddress::Inet {
                addr: [127, 0, 0, 1],
                port
            }]
        );
    }

    #[tokio::test]
    async fn test_done_reported_exactly_once() {
        // Ports picked from the dynamic range with nothing listening.
        let scanner = Scanner::new();
        let mut rx = scanner.start(
            ScanTarget::PortRange {
                addr: "127.0.0.1".parse().unwrap(),
                from: 1,
                to: 3,
            },
            flags::NO_NAME_LOOKUP,
        );
        let mut dones = 0;
        while let Some(ev) = rx.recv().await {
            if ev == ScanEvent::Done {
                dones += 1;
            }
        }
        assert_eq!(dones, 1);
    }

    #[test]
    fn test_expand_rejects_inverted_range() {
        assert!(expand(&ScanTarget::PortRange {
            addr: "127.0.0.1".parse().unwrap(),
            from: 10,
            to: 1,
        })
        .is_err());
    }

    #[test]
    fn test_expand_subnet_covers_hosts() {
        let out = expand(&ScanTarget::Subnet {
            base: Some(Ipv4Addr::new(192, 0, 2, 0)),
            port: 80,
        })
        .unwrap();
        assert_eq!(out.len(), 254);
        assert_eq!(out[0], "192.0.2.1:80".parse().unwrap());
        assert_eq!(out[253], "192.0.2.254:80".parse().unwrap());
    }
}
