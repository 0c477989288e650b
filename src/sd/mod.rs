//! mDNS/DNS-SD service discovery.
//!
//! Thin typed wrapper over the platform mDNS client: browse a service type,
//! get resolved entries and removals on a channel. Consumed by the internal
//! browse server.

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::pal::net::SocketAddress;

/// One discovery result.
#[derive(Debug, Clone, PartialEq)]
pub struct SdResult {
    /// Service type, e.g. `_ssh._tcp.local.`.
    pub service: String,
    /// Instance name within the service type.
    pub entry: String,
    /// Domain; mDNS is always `local.`.
    pub domain: String,
    /// Resolved addresses; empty until the instance resolves.
    pub addrs: Vec<SocketAddress>,
    /// `true` when the instance disappeared.
    pub removed: bool,
}

/// Browse session holder; dropping it stops the browse.
pub struct SdClient {
    daemon: ServiceDaemon,
    service: String,
}

impl SdClient {
    /// Start browsing `service` (e.g. `_http._tcp.local.`); results arrive
    /// on the returned channel.
    pub fn browse(service: &str) -> Result<(SdClient, mpsc::Receiver<SdResult>)> {
        let daemon = ServiceDaemon::new().map_err(|e| {
            warn!(err = %e, "mDNS daemon unavailable");
            Error::NotSupported
        })?;
        let events = daemon.browse(service).map_err(|_| Error::Arg)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = events.recv() {
                let result = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let port = info.get_port();
                        SdResult {
                            service: info.get_type().to_owned(),
                            entry: info.get_fullname().to_owned(),
                            domain: "local.".to_owned(),
                            addrs: info
                                .get_addresses()
                                .iter()
                                .map(|ip| {
                                    SocketAddress::from_std(std::net::SocketAddr::new(*ip, port))
                                })
                                .collect(),
                            removed: false,
                        }
                    }
                    ServiceEvent::ServiceRemoved(ty, fullname) => SdResult {
                        service: ty,
                        entry: fullname,
                        domain: "local.".to_owned(),
                        addrs: Vec::new(),
                        removed: true,
                    },
                    ServiceEvent::SearchStopped(_) => break,
                    _ => continue,
                };
                if tx.blocking_send(result).is_err() {
                    break;
                }
            }
            debug!("mDNS browse finished");
        });

        debug!(service, "mDNS browse started");
        Ok((
            SdClient {
                daemon,
                service: service.to_owned(),
            },
            rx,
        ))
    }
}

impl Drop for SdClient {
    fn drop(&mut self) {
        let _ = self.daemon.stop_browse(&self.service);
        let _ = self.daemon.shutdown();
    }
}
