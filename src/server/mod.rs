// SPDX-License-Identifier: MIT
//! Proxy server engine.
//!
//! Owns the control listener, the socket table, and the garbage-collection
//! worker. Inbound control messages are routed by target reference: the
//! null reference selects the top-level handlers (ping, link), anything
//! else selects a socket's control handler — or a `closed` response when no
//! such socket exists. The worker runs every ten seconds and walks each
//! socket through timeout, linger, collect, and destroy.

pub(crate) mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::browse::{BrowseServer, BROWSE_PORT};
use crate::err::{Error, Result};
use crate::io::codec::CodecId;
use crate::io::message::{Message, MessageKind, Payload};
use crate::io::reference::Reference;
use crate::ns::NsEntry;
use crate::pal::net::{self, Family, SocketAddress};
use crate::pal::{PalSocket, SocketEvents, SocketProps};
use crate::sched::{ticks_ms, Scheduler, SchedulerHandle};
use crate::transport::{Connection, ConnectionEvent, EventHandler, Transport};

use socket::{ServerSocket, SocketState};

/// Floor for a socket's inactivity timeout.
pub(crate) const MIN_GC_TIMEOUT: u64 = 10_000;
/// Timeout applied when a link request leaves it unset.
pub(crate) const DEFAULT_GC_TIMEOUT: u64 = 30_000;
/// Grace for draining queues once a socket is collected.
const LINGER_TIMEOUT: u64 = DEFAULT_GC_TIMEOUT;
/// How long a platform close may take before it is forced.
const CLOSING_TIMEOUT: u64 = DEFAULT_GC_TIMEOUT;
/// Worker cadence.
const WORKER_INTERVAL: u64 = 10_000;

pub struct ProxyServer {
    /// Server id == proxy id == the listener entry's address.
    pub(crate) id: Reference,
    listener: Mutex<Option<Arc<Connection>>>,
    transport: Arc<dyn Transport>,
    /// Present when the platform can open outbound WebSocket streams.
    ws_transport: Option<Arc<dyn Transport>>,
    browser: Arc<BrowseServer>,
    restricted_ports: Vec<(u16, u16)>,
    sockets: Mutex<HashMap<Reference, Arc<ServerSocket>>>,
    pub(crate) sched: Arc<SchedulerHandle>,
    exit: AtomicBool,
    finished: AtomicBool,
    done: watch::Sender<bool>,
    weak: Weak<ProxyServer>,
}

impl ProxyServer {
    /// Create a server listening on the endpoint described by `entry`.
    /// `restricted_ports` are inclusive tuples of forbidden destinations.
    pub fn create(
        transport: Arc<dyn Transport>,
        ws_transport: Option<Arc<dyn Transport>>,
        entry: &NsEntry,
        scheduler: &Arc<Scheduler>,
        restricted_ports: Vec<(u16, u16)>,
        browse_fs: bool,
    ) -> Result<Arc<ProxyServer>> {
        let sched = scheduler.handle();
        let browser = BrowseServer::new(sched.child(), browse_fs);

        let server = Arc::new_cyclic(|weak| ProxyServer {
            id: entry.addr(),
            listener: Mutex::new(None),
            transport: transport.clone(),
            ws_transport,
            browser,
            restricted_ports,
            sockets: Mutex::new(HashMap::new()),
            sched,
            exit: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done: watch::channel(false).0,
            weak: weak.clone(),
        });

        // Control listener; JSON is the control-channel codec.
        let weak = Arc::downgrade(&server);
        let handler: EventHandler = Arc::new(move |ev| {
            if let Some(server) = weak.upgrade() {
                server.handle_event(ev);
            }
        });
        let listener = transport.create(entry, CodecId::Json, handler, server.sched.clone())?;
        *server.listener.lock().unwrap() = Some(listener);
        info!(id = %server.id, "proxy server created");

        server.poke_worker();
        Ok(server)
    }

    // ── Table ────────────────────────────────────────────────────────────────

    pub(crate) fn insert(&self, sock: Arc<ServerSocket>) {
        self.sockets.lock().unwrap().insert(sock.id, sock);
    }

    pub(crate) fn remove(&self, id: &Reference) {
        self.sockets.lock().unwrap().remove(id);
    }

    pub(crate) fn get(&self, id: &Reference) -> Option<Arc<ServerSocket>> {
        self.sockets.lock().unwrap().get(id).cloned()
    }

    /// Active socket count; used by tests and diagnostics.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    pub(crate) fn listener(&self) -> Option<Arc<Connection>> {
        self.listener.lock().unwrap().clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn ws_transport(&self) -> Option<Arc<dyn Transport>> {
        self.ws_transport.clone()
    }

    fn check_restricted_port(&self, port: u16) -> Result<()> {
        for (lo, hi) in &self.restricted_ports {
            if port >= *lo && port <= *hi {
                trace!(port, "blocking access to restricted port");
                return Err(Error::Refused);
            }
        }
        Ok(())
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Begin shutdown: close the listener, collect every socket, free the
    /// engine once the table drains.
    pub fn shutdown(&self) {
        let listener = self.listener.lock().unwrap().clone();
        match listener {
            Some(conn) => conn.close(),
            None => {
                self.exit.store(true, Ordering::Release);
                self.poke_worker();
            }
        }
    }

    /// Wait until shutdown has fully drained the socket table.
    pub async fn join(&self) {
        let mut done = self.done.subscribe();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    fn handle_event(self: &Arc<Self>, ev: ConnectionEvent) {
        match ev {
            ConnectionEvent::Received(message) => self.handle_message(message),
            ConnectionEvent::Reconnecting(e) => {
                trace!(err = %e, "server connection is reconnecting");
            }
            ConnectionEvent::Closed => {
                *self.listener.lock().unwrap() = None;
                self.exit.store(true, Ordering::Release);
                self.poke_worker();
            }
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message) {
        if !message.target.is_null() {
            match self.get(&message.target) {
                Some(sock) => sock.control_message(message),
                None => self.handle_invalid_socket(message),
            }
            return;
        }
        match message.kind() {
            MessageKind::Ping => self.handle_ping(message),
            MessageKind::Link => self.handle_link(message),
            other => {
                error!(kind = ?other, "received unsupported message type");
                let mut response = message.as_response();
                response.set_error(Some(Error::NotSupported));
                if let Some(listener) = self.listener() {
                    let _ = listener.send(&response);
                }
            }
        }
    }

    /// A message addressed to a socket that no longer exists.
    fn handle_invalid_socket(&self, message: Message) {
        let mut response = message.as_response();
        response.set_error(Some(Error::Closed));
        if let Some(listener) = self.listener() {
            if let Err(e) = listener.send(&response) {
                error!(err = %e, "failed sending error response");
            }
        }
    }

    // ── Ping ─────────────────────────────────────────────────────────────────

    fn handle_ping(self: &Arc<Self>, message: Message) {
        let Payload::PingRequest { address } = message.payload.clone() else {
            return;
        };
        // Validate before going async: family and restricted ports.
        let precheck = match address.family() {
            Family::Inet | Family::Inet6 | Family::Proxy => {
                self.check_restricted_port(address.port().unwrap_or(0))
            }
            other => {
                error!(family = ?other, "ping request with invalid address family");
                Err(Error::InvalidFormat)
            }
        };

        let weak = self.weak.clone();
        tokio::spawn(async move {
            let resolved: Result<SocketAddress> = async {
                precheck?;
                match &address {
                    SocketAddress::Proxy { host, port, .. } => {
                        if host.is_empty() {
                            return Err(Error::InvalidFormat);
                        }
                        let mut addrs = net::resolve(host, *port, Family::Unspec).await?;
                        Ok(addrs.swap_remove(0))
                    }
                    literal => {
                        let host = literal.host_string()?;
                        let mut addrs =
                            net::resolve(&host, literal.port().unwrap_or(0), literal.family())
                                .await?;
                        Ok(addrs.swap_remove(0))
                    }
                }
            }
            .await;

            let Some(server) = weak.upgrade() else { return };
            let (payload, err) = match resolved {
                Ok(address) => (Payload::PingResponse { address }, None),
                Err(e) => {
                    debug!(err = %e, "ping resolution failed");
                    (
                        Payload::PingResponse {
                            address: SocketAddress::Unspec,
                        },
                        Some(e),
                    )
                }
            };
            let mut response = message.into_response(payload);
            response.set_error(err);
            response.proxy = server.id;
            if let Some(listener) = server.listener() {
                if let Err(e) = listener.send(&response) {
                    error!(err = %e, "failed sending ping response");
                }
            }
        });
    }

    // ── Link ─────────────────────────────────────────────────────────────────

    fn handle_link(self: &Arc<Self>, message: Message) {
        match self.try_link(&message) {
            Ok(sock) => {
                // Park the response; the platform open completion sends it.
                sock.touch();
                sock.park_link_message(message);
            }
            Err(e) => {
                error!(err = %e, "failed to link socket");
                let mut response = message.into_response(Payload::LinkResponse {
                    version: crate::io::message::LINK_VERSION,
                    link_id: Reference::NULL,
                    local_address: SocketAddress::Unspec,
                    peer_address: SocketAddress::Unspec,
                });
                response.set_error(Some(e));
                response.proxy = self.id;
                if let Some(listener) = self.listener() {
                    if let Err(e) = listener.send(&response) {
                        error!(err = %e, "failed sending link error response");
                    }
                }
            }
        }
    }

    fn try_link(self: &Arc<Self>, message: &Message) -> Result<Arc<ServerSocket>> {
        let Payload::LinkRequest { props, .. } = &message.payload else {
            return Err(Error::InvalidFormat);
        };

        // Restricted ports bind plain outbound links only.
        if !props.is_internal() && !props.is_passive() {
            self.check_restricted_port(props.address.port().unwrap_or(0))?;
        }

        let sock = ServerSocket::create(self, message.source);

        // Effective properties: clamp the gc timeout.
        let mut effective = props.clone();
        if effective.timeout == 0 {
            effective.timeout = DEFAULT_GC_TIMEOUT;
        } else if effective.timeout < MIN_GC_TIMEOUT {
            effective.timeout = MIN_GC_TIMEOUT;
        }
        sock.set_props(effective.clone());

        let result = if !props.is_internal() {
            self.link_platform_socket(&sock, effective)
        } else {
            self.link_internal_socket(&sock, props)
        };
        if let Err(e) = result {
            self.remove(&sock.id);
            return Err(e);
        }
        Ok(sock)
    }

    fn link_platform_socket(
        &self,
        sock: &Arc<ServerSocket>,
        effective: SocketProps,
    ) -> Result<()> {
        let sock_dyn: Arc<dyn SocketEvents> = sock.clone();
        let events: std::sync::Weak<dyn SocketEvents> = Arc::downgrade(&sock_dyn);
        let pal = PalSocket::create(effective, events);
        sock.set_pal(pal.clone());
        pal.open()
    }

    /// Internal links carry an empty host; the port names an in-process
    /// service, realized over an already-open local pair.
    fn link_internal_socket(&self, sock: &Arc<ServerSocket>, props: &SocketProps) -> Result<()> {
        let SocketAddress::Proxy { host, port, flags } = &props.address else {
            error!("bad address provided for internal server link");
            return Err(Error::InvalidFormat);
        };
        if !host.is_empty() {
            error!("bad address provided for internal server link");
            return Err(Error::InvalidFormat);
        }
        match *port {
            BROWSE_PORT => {
                // Codec id rides the proxy-address flags.
                let codec = CodecId::from_u32(*flags).ok_or(Error::NotSupported)?;
                let (itf, endpoint) = self.browser.accept(codec)?;
                let sock_dyn: Arc<dyn SocketEvents> = sock.clone();
                let events: std::sync::Weak<dyn SocketEvents> = Arc::downgrade(&sock_dyn);
                let (outer, inner) =
                    PalSocket::pair(sock.props(), events, itf.props, itf.events);
                sock.set_pal(outer);
                endpoint.attach(inner);
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    // ── Worker ───────────────────────────────────────────────────────────────

    pub(crate) fn poke_worker(&self) {
        let weak = self.weak.clone();
        self.sched.queue("worker_poke", move || {
            if let Some(server) = weak.upgrade() {
                server.worker();
            }
        });
    }

    /// Timeout, linger, collect, and destroy transitions for every socket;
    /// reschedules itself every [`WORKER_INTERVAL`].
    fn worker(self: &Arc<Self>) {
        let now = ticks_ms();
        let exit = self.exit.load(Ordering::Acquire);

        self.sched.clear("worker");
        let weak = self.weak.clone();
        self.sched.defer("worker", WORKER_INTERVAL, move || {
            if let Some(server) = weak.upgrade() {
                server.worker();
            }
        });

        let snapshot: Vec<Arc<ServerSocket>> =
            self.sockets.lock().unwrap().values().cloned().collect();

        for sock in snapshot {
            // Idle check; a timed-out socket falls back to the default gc
            // window for the stages that follow.
            let timeout = sock.timeout();
            let last = sock.last_activity();
            let timedout = last != 0
                && timeout != 0
                && now.saturating_sub(last) >= timeout;
            if timedout {
                sock.set_timeout(DEFAULT_GC_TIMEOUT);
            }

            let mut state = sock.state();

            if state == SocketState::Closing {
                if !timedout {
                    continue;
                }
                error!(id = %sock.id, "waited for close to complete, but timed out");
                sock.set_state(SocketState::Closed);
                state = SocketState::Closed;
            }

            if state == SocketState::Closed {
                sock.empty_socket_queues();
                sock.empty_transport_queues();
                if let Some(conn) = sock.take_stream() {
                    trace!(id = %sock.id, "socket closed, cleaning up stream");
                    conn.close();
                }
                self.remove(&sock.id);
                continue;
            }

            if state == SocketState::Opened {
                if !timedout && !exit {
                    continue;
                }
                if timedout && !exit {
                    info!(id = %sock.id, "no activity on socket, closing");
                    // Make room for the close notification, then deliver it.
                    sock.empty_socket_queues();
                    if sock.push_local_close().is_ok() {
                        sock.touch();
                        sock.deliver_results();
                        sock.set_state(SocketState::Collect);
                        continue;
                    }
                }
                sock.set_state(SocketState::Created);
                state = SocketState::Created;
            }

            if state == SocketState::Created {
                if !timedout && !exit {
                    continue;
                }
                if timedout && !exit {
                    info!(id = %sock.id, "no activity on socket, destroying");
                }
                sock.empty_socket_queues();
                sock.set_state(SocketState::Collect);
                state = SocketState::Collect;
            }

            if state == SocketState::Collect {
                let Some(pal) = sock.pal() else {
                    sock.set_state(SocketState::Closed);
                    self.poke_worker();
                    continue;
                };
                sock.deliver_results();

                if sock.queues_busy() && !timedout && !exit {
                    // Still draining: linger.
                    sock.set_timeout(LINGER_TIMEOUT);
                    continue;
                }

                // Answer outstanding polls, then close the platform socket.
                sock.manage_read_queue(true);
                trace!(id = %sock.id, "worker closing socket");
                sock.set_timeout(CLOSING_TIMEOUT);
                sock.touch();
                sock.set_state(SocketState::Closing);
                pal.close();
            }
        }

        if exit && self.sockets.lock().unwrap().is_empty() {
            if !self.finished.swap(true, Ordering::AcqRel) {
                info!(id = %self.id, "proxy server drained, exiting");
                self.sched.clear("worker");
                self.done.send_replace(true);
            }
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        debug!(id = %self.id, "proxy server dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_port_tuples() {
        fn server_like_check(ranges: &[(u16, u16)], port: u16) -> bool {
            ranges.iter().any(|(lo, hi)| port >= *lo && port <= *hi)
        }
        let ranges = vec![(80, 80), (443, 443), (8000, 8099)];
        assert!(server_like_check(&ranges, 80));
        assert!(server_like_check(&ranges, 8050));
        assert!(!server_like_check(&ranges, 81));
        assert!(!server_like_check(&ranges, 7999));
    }
}
