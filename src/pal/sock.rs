// SPDX-License-Identifier: MIT
//! Asynchronous socket adapter over the tokio reactor.
//!
//! Open resolves the target (trying each candidate of a proxy-hostname in
//! order), connects streams, binds datagrams, and binds + listens passive
//! sockets. After a successful open the adapter runs a send loop and a
//! receive loop (an accept loop for listeners); each loop suspends while its
//! enable flag is off and resumes on `can_send`/`can_recv`. Close is
//! asynchronous: both loops are interrupted and joined before the owner's
//! `closed` callback fires, so no `end_*` can arrive after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol as RawProtocol, Socket as RawSocket, Type as RawType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::err::{Error, Result};
use crate::pal::net::{self, Family, SocketAddress, SocketKind};
use crate::pal::{AcceptItf, MulticastOption, SendOp, SockOpt, SocketEvents, SocketProps};

/// In-memory pair capacity, enough to absorb one full receive window.
const PAIR_BUFFER: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    Closed,
    Opening,
    Open,
    Closing,
}

enum Reader {
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Dgram(Arc<UdpSocket>),
}

enum Writer {
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    Dgram(Arc<UdpSocket>),
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Uniform asynchronous socket handle.
pub struct PalSocket {
    props: Mutex<SocketProps>,
    events: Weak<dyn SocketEvents>,
    state: Mutex<SockState>,
    send_enabled: AtomicBool,
    recv_enabled: AtomicBool,
    send_wake: Notify,
    recv_wake: Notify,
    closed_tx: watch::Sender<bool>,
    local: Mutex<Option<SocketAddress>>,
    peer: Mutex<Option<SocketAddress>>,
    /// Duplicated handle for option queries and multicast membership.
    ctl: Mutex<Option<RawSocket>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl PalSocket {
    /// Create an unopened socket bound to the given client interface.
    pub fn create(props: SocketProps, events: Weak<dyn SocketEvents>) -> Arc<PalSocket> {
        Arc::new(PalSocket {
            props: Mutex::new(props),
            events,
            state: Mutex::new(SockState::Closed),
            send_enabled: AtomicBool::new(false),
            recv_enabled: AtomicBool::new(false),
            send_wake: Notify::new(),
            recv_wake: Notify::new(),
            closed_tx: watch::channel(false).0,
            local: Mutex::new(None),
            peer: Mutex::new(None),
            ctl: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Create two already-open sockets connected back to back. Used for
    /// internal sockets whose peer is an in-process server.
    pub fn pair(
        props_a: SocketProps,
        events_a: Weak<dyn SocketEvents>,
        props_b: SocketProps,
        events_b: Weak<dyn SocketEvents>,
    ) -> (Arc<PalSocket>, Arc<PalSocket>) {
        let (left, right) = tokio::io::duplex(PAIR_BUFFER);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);

        let a = PalSocket::create(props_a, events_a);
        let b = PalSocket::create(props_b, events_b);
        a.set_state(SockState::Open);
        b.set_state(SockState::Open);
        a.start_open_stream(Reader::Stream(Box::new(lr)), Writer::Stream(Box::new(lw)));
        b.start_open_stream(Reader::Stream(Box::new(rr)), Writer::Stream(Box::new(rw)));

        for sock in [&a, &b] {
            let sock = sock.clone();
            tokio::spawn(async move {
                if let Some(events) = sock.events() {
                    events.opened(Ok(()));
                }
            });
        }
        (a, b)
    }

    fn events(&self) -> Option<Arc<dyn SocketEvents>> {
        self.events.upgrade()
    }

    fn set_state(&self, state: SockState) {
        *self.state.lock().unwrap() = state;
    }

    /// Begin the open sequence; completion arrives via `SocketEvents::opened`.
    pub fn open(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SockState::Closed {
                return Err(Error::BadState);
            }
            *state = SockState::Opening;
        }
        let sock = self.clone();
        tokio::spawn(async move {
            let result = sock.open_inner().await;
            match &result {
                Ok(()) => {
                    sock.set_state(SockState::Open);
                    debug!(addr = %sock.props.lock().unwrap().address, "socket open");
                }
                Err(e) => {
                    sock.set_state(SockState::Closed);
                    debug!(err = %e, "socket open failed");
                }
            }
            if let Some(events) = sock.events() {
                events.opened(result);
            }
        });
        Ok(())
    }

    async fn open_inner(self: &Arc<Self>) -> Result<()> {
        let props = self.props.lock().unwrap().clone();
        let candidates = net::resolve_address(&props.address).await?;

        if props.is_passive() {
            return self.open_passive(&props, &candidates).await;
        }
        match props.kind {
            SocketKind::Stream => self.open_stream(&props, &candidates).await,
            SocketKind::Dgram => self.open_dgram(&props, &candidates).await,
            SocketKind::Raw => self.open_raw(&props, &candidates).await,
            SocketKind::SeqPacket => Err(Error::NotSupported),
        }
    }

    /// Connect a stream socket, trying each resolved candidate in order.
    async fn open_stream(self: &Arc<Self>, props: &SocketProps, candidates: &[SocketAddress]) -> Result<()> {
        let mut last_error = Error::NoAddress;
        for candidate in candidates {
            match candidate {
                SocketAddress::Unix { path } => {
                    #[cfg(unix)]
                    {
                        match tokio::net::UnixStream::connect(path).await {
                            Ok(stream) => {
                                let std = stream.into_std().map_err(Error::from)?;
                                let ctl = std.try_clone().map_err(Error::from)?;
                                *self.ctl.lock().unwrap() = Some(RawSocket::from(ctl));
                                *self.local.lock().unwrap() =
                                    Some(SocketAddress::Unix { path: path.clone() });
                                *self.peer.lock().unwrap() =
                                    Some(SocketAddress::Unix { path: path.clone() });
                                let stream =
                                    tokio::net::UnixStream::from_std(std).map_err(Error::from)?;
                                let (r, w) = stream.into_split();
                                self.start_open_stream(
                                    Reader::Stream(Box::new(r)),
                                    Writer::Stream(Box::new(w)),
                                );
                                return Ok(());
                            }
                            Err(e) => last_error = e.into(),
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = path;
                        last_error = Error::NotSupported;
                    }
                }
                _ => {
                    let Some(sa) = candidate.to_std() else {
                        last_error = Error::AddressFamily;
                        continue;
                    };
                    match TcpStream::connect(sa).await {
                        Ok(stream) => {
                            let std = stream.into_std().map_err(Error::from)?;
                            let ctl = std.try_clone().map_err(Error::from)?;
                            *self.ctl.lock().unwrap() = Some(RawSocket::from(ctl));
                            let stream = TcpStream::from_std(std).map_err(Error::from)?;
                            *self.local.lock().unwrap() =
                                stream.local_addr().ok().map(SocketAddress::from_std);
                            *self.peer.lock().unwrap() =
                                stream.peer_addr().ok().map(SocketAddress::from_std);
                            let (r, w) = stream.into_split();
                            self.start_open_stream(
                                Reader::Stream(Box::new(r)),
                                Writer::Stream(Box::new(w)),
                            );
                            return Ok(());
                        }
                        Err(e) => {
                            trace!(addr = %candidate, err = %e, "connect candidate failed");
                            last_error = e.into();
                        }
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn open_dgram(self: &Arc<Self>, _props: &SocketProps, candidates: &[SocketAddress]) -> Result<()> {
        let mut last_error = Error::NoAddress;
        for candidate in candidates {
            let Some(sa) = candidate.to_std() else {
                last_error = Error::AddressFamily;
                continue;
            };
            match UdpSocket::bind(sa).await {
                Ok(udp) => {
                    let std = udp.into_std().map_err(Error::from)?;
                    let ctl = std.try_clone().map_err(Error::from)?;
                    *self.ctl.lock().unwrap() = Some(RawSocket::from(ctl));
                    let udp = Arc::new(UdpSocket::from_std(std).map_err(Error::from)?);
                    *self.local.lock().unwrap() =
                        udp.local_addr().ok().map(SocketAddress::from_std);
                    self.start_open_dgram(udp);
                    return Ok(());
                }
                Err(e) => last_error = e.into(),
            }
        }
        Err(last_error)
    }

    /// Raw sockets ride the datagram path: socket2 creates the descriptor,
    /// tokio's UdpSocket drives it.
    async fn open_raw(self: &Arc<Self>, props: &SocketProps, candidates: &[SocketAddress]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::fd::{FromRawFd, IntoRawFd};

            let mut last_error = Error::NoAddress;
            for candidate in candidates {
                let Some(sa) = candidate.to_std() else {
                    last_error = Error::AddressFamily;
                    continue;
                };
                let domain = if sa.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
                let protocol = match props.protocol {
                    net::Protocol::Icmp => Some(RawProtocol::ICMPV4),
                    net::Protocol::Icmpv6 => Some(RawProtocol::ICMPV6),
                    net::Protocol::Udp => Some(RawProtocol::UDP),
                    net::Protocol::Tcp => Some(RawProtocol::TCP),
                    net::Protocol::Unspec => None,
                };
                let raw = match RawSocket::new(domain, RawType::RAW, protocol) {
                    Ok(raw) => raw,
                    Err(e) => {
                        last_error = e.into();
                        continue;
                    }
                };
                let bound = raw
                    .set_nonblocking(true)
                    .and_then(|_| raw.bind(&sa.into()));
                if let Err(e) = bound {
                    last_error = e.into();
                    continue;
                }
                let ctl = raw.try_clone().map_err(Error::from)?;
                let std = unsafe { std::net::UdpSocket::from_raw_fd(raw.into_raw_fd()) };
                let udp = Arc::new(UdpSocket::from_std(std).map_err(Error::from)?);
                *self.ctl.lock().unwrap() = Some(ctl);
                *self.local.lock().unwrap() = Some(candidate.clone());
                self.start_open_dgram(udp);
                return Ok(());
            }
            Err(last_error)
        }
        #[cfg(not(unix))]
        {
            let _ = (props, candidates);
            Err(Error::NotSupported)
        }
    }

    async fn open_passive(self: &Arc<Self>, props: &SocketProps, candidates: &[SocketAddress]) -> Result<()> {
        if props.kind == SocketKind::Dgram {
            // Passive datagram is just a bound socket.
            return self.open_dgram(props, candidates).await;
        }
        let mut last_error = Error::NoAddress;
        for candidate in candidates {
            match candidate {
                SocketAddress::Unix { path } => {
                    #[cfg(unix)]
                    {
                        match tokio::net::UnixListener::bind(path) {
                            Ok(listener) => {
                                *self.local.lock().unwrap() =
                                    Some(SocketAddress::Unix { path: path.clone() });
                                self.start_open_acceptor(Acceptor::Unix(listener));
                                return Ok(());
                            }
                            Err(e) => last_error = e.into(),
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = path;
                        last_error = Error::NotSupported;
                    }
                }
                _ => {
                    let Some(sa) = candidate.to_std() else {
                        last_error = Error::AddressFamily;
                        continue;
                    };
                    match TcpListener::bind(sa).await {
                        Ok(listener) => {
                            *self.local.lock().unwrap() =
                                listener.local_addr().ok().map(SocketAddress::from_std);
                            self.start_open_acceptor(Acceptor::Tcp(listener));
                            return Ok(());
                        }
                        Err(e) => last_error = e.into(),
                    }
                }
            }
        }
        Err(last_error)
    }

    fn start_open_stream(self: &Arc<Self>, reader: Reader, writer: Writer) {
        let mut loops = self.loops.lock().unwrap();
        loops.push(tokio::spawn(recv_loop(self.clone(), reader)));
        loops.push(tokio::spawn(send_loop(self.clone(), writer)));
    }

    fn start_open_dgram(self: &Arc<Self>, udp: Arc<UdpSocket>) {
        self.start_open_stream(Reader::Dgram(udp.clone()), Writer::Dgram(udp));
    }

    fn start_open_acceptor(self: &Arc<Self>, acceptor: Acceptor) {
        let mut loops = self.loops.lock().unwrap();
        loops.push(tokio::spawn(accept_loop(self.clone(), acceptor)));
    }

    /// Wrap an accepted, already-connected stream in an open socket. Both
    /// loops start parked; the owner enables them once its state allows.
    fn adopt_tcp(props: SocketProps, events: Weak<dyn SocketEvents>, stream: TcpStream) -> Result<Arc<PalSocket>> {
        let std = stream.into_std().map_err(Error::from)?;
        let ctl = std.try_clone().map_err(Error::from)?;
        let stream = TcpStream::from_std(std).map_err(Error::from)?;

        let sock = PalSocket::create(props, events);
        *sock.ctl.lock().unwrap() = Some(RawSocket::from(ctl));
        *sock.local.lock().unwrap() = stream.local_addr().ok().map(SocketAddress::from_std);
        *sock.peer.lock().unwrap() = stream.peer_addr().ok().map(SocketAddress::from_std);
        sock.set_state(SockState::Open);
        let (r, w) = stream.into_split();
        sock.start_open_stream(Reader::Stream(Box::new(r)), Writer::Stream(Box::new(w)));
        Ok(sock)
    }

    #[cfg(unix)]
    fn adopt_unix(
        props: SocketProps,
        events: Weak<dyn SocketEvents>,
        stream: tokio::net::UnixStream,
    ) -> Result<Arc<PalSocket>> {
        let sock = PalSocket::create(props, events);
        sock.set_state(SockState::Open);
        let (r, w) = stream.into_split();
        sock.start_open_stream(Reader::Stream(Box::new(r)), Writer::Stream(Box::new(w)));
        Ok(sock)
    }

    /// Begin the asynchronous close; `SocketEvents::closed` fires once both
    /// loops have resolved their in-flight operations.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SockState::Closing {
                return;
            }
            *state = SockState::Closing;
        }
        // send_replace so loops spawned by a still-racing open see the
        // closed value even though they subscribe late.
        self.closed_tx.send_replace(true);
        self.send_wake.notify_one();
        self.recv_wake.notify_one();

        let sock = self.clone();
        tokio::spawn(async move {
            let handles: Vec<_> = sock.loops.lock().unwrap().drain(..).collect();
            for handle in handles {
                let _ = handle.await;
            }
            *sock.ctl.lock().unwrap() = None;
            sock.set_state(SockState::Closed);
            trace!("socket closed");
            if let Some(events) = sock.events() {
                events.closed();
            }
        });
    }

    /// Enable or disable the send loop; enabling an already-running loop is
    /// a no-op.
    pub fn can_send(&self, enable: bool) {
        self.send_enabled.store(enable, Ordering::Release);
        if enable {
            self.send_wake.notify_one();
        }
    }

    /// Enable or disable the receive (or accept) loop.
    pub fn can_recv(&self, enable: bool) {
        self.recv_enabled.store(enable, Ordering::Release);
        if enable {
            self.recv_wake.notify_one();
        }
    }

    pub fn get_properties(&self) -> SocketProps {
        self.props.lock().unwrap().clone()
    }

    pub fn getsockname(&self) -> Result<SocketAddress> {
        self.local.lock().unwrap().clone().ok_or(Error::Closed)
    }

    pub fn getpeername(&self) -> Result<SocketAddress> {
        self.peer.lock().unwrap().clone().ok_or(Error::NoAddress)
    }

    pub fn getsockopt(&self, opt: SockOpt) -> Result<u64> {
        let guard = self.ctl.lock().unwrap();
        let ctl = guard.as_ref().ok_or(Error::NotSupported)?;
        let value = match opt {
            SockOpt::Rcvbuf => ctl.recv_buffer_size().map_err(Error::from)? as u64,
            SockOpt::Sndbuf => ctl.send_buffer_size().map_err(Error::from)? as u64,
            SockOpt::ReuseAddr => ctl.reuse_address().map_err(Error::from)? as u64,
            SockOpt::Broadcast => ctl.broadcast().map_err(Error::from)? as u64,
            SockOpt::Keepalive => ctl.keepalive().map_err(Error::from)? as u64,
            SockOpt::Nodelay => ctl.nodelay().map_err(Error::from)? as u64,
            SockOpt::Ttl => ctl.ttl().map_err(Error::from)? as u64,
            SockOpt::Linger => ctl
                .linger()
                .map_err(Error::from)?
                .map_or(0, |d| d.as_secs()),
            SockOpt::PropsTimeout | SockOpt::IpMulticastJoin | SockOpt::IpMulticastLeave => {
                return Err(Error::NotSupported)
            }
        };
        Ok(value)
    }

    pub fn setsockopt(&self, opt: SockOpt, value: u64) -> Result<()> {
        let guard = self.ctl.lock().unwrap();
        let ctl = guard.as_ref().ok_or(Error::NotSupported)?;
        match opt {
            SockOpt::Rcvbuf => ctl.set_recv_buffer_size(value as usize).map_err(Error::from),
            SockOpt::Sndbuf => ctl.set_send_buffer_size(value as usize).map_err(Error::from),
            SockOpt::ReuseAddr => ctl.set_reuse_address(value != 0).map_err(Error::from),
            SockOpt::Broadcast => ctl.set_broadcast(value != 0).map_err(Error::from),
            SockOpt::Keepalive => ctl.set_keepalive(value != 0).map_err(Error::from),
            SockOpt::Nodelay => ctl.set_nodelay(value != 0).map_err(Error::from),
            SockOpt::Ttl => ctl.set_ttl(value as u32).map_err(Error::from),
            SockOpt::Linger => {
                let linger = (value != 0).then(|| Duration::from_secs(value));
                ctl.set_linger(linger).map_err(Error::from)
            }
            SockOpt::PropsTimeout | SockOpt::IpMulticastJoin | SockOpt::IpMulticastLeave => {
                Err(Error::NotSupported)
            }
        }
    }

    pub fn join_multicast_group(&self, mcast: &MulticastOption) -> Result<()> {
        self.multicast(mcast, true)
    }

    pub fn leave_multicast_group(&self, mcast: &MulticastOption) -> Result<()> {
        self.multicast(mcast, false)
    }

    fn multicast(&self, mcast: &MulticastOption, join: bool) -> Result<()> {
        let guard = self.ctl.lock().unwrap();
        let ctl = guard.as_ref().ok_or(Error::NotSupported)?;
        match &mcast.address {
            SocketAddress::Inet { addr, .. } => {
                let group = std::net::Ipv4Addr::from(*addr);
                let interface = socket2::InterfaceIndexOrAddress::Index(mcast.interface_index);
                if join {
                    ctl.join_multicast_v4_n(&group, &interface).map_err(Error::from)
                } else {
                    ctl.leave_multicast_v4_n(&group, &interface).map_err(Error::from)
                }
            }
            SocketAddress::Inet6 { addr, .. } => {
                let group = std::net::Ipv6Addr::from(*addr);
                if join {
                    ctl.join_multicast_v6(&group, mcast.interface_index)
                        .map_err(Error::from)
                } else {
                    ctl.leave_multicast_v6(&group, mcast.interface_index)
                        .map_err(Error::from)
                }
            }
            _ => Err(Error::AddressFamily),
        }
    }
}

// ─── Loops ────────────────────────────────────────────────────────────────────

/// Park until the flag goes up; `false` means the socket is closing.
async fn wait_enabled(
    flag: &AtomicBool,
    wake: &Notify,
    closed: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *closed.borrow() {
            return false;
        }
        if flag.load(Ordering::Acquire) {
            return true;
        }
        tokio::select! {
            _ = wake.notified() => {}
            _ = closed.changed() => {}
        }
    }
}

impl Reader {
    fn is_stream(&self) -> bool {
        matches!(self, Reader::Stream(_))
    }

    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<Option<SocketAddress>> {
        match self {
            Reader::Stream(r) => {
                r.read_buf(buf).await.map_err(Error::from)?;
                Ok(None)
            }
            Reader::Dgram(s) => {
                let (_, from) = s.recv_buf_from(buf).await.map_err(Error::from)?;
                Ok(Some(SocketAddress::from_std(from)))
            }
        }
    }
}

impl Writer {
    async fn write_op(&mut self, op: &SendOp, peer: Option<SocketAddress>) -> Result<usize> {
        match self {
            Writer::Stream(w) => {
                w.write_all(&op.buf).await.map_err(Error::from)?;
                w.flush().await.map_err(Error::from)?;
                Ok(op.buf.len())
            }
            Writer::Dgram(s) => {
                let target = op
                    .to
                    .as_ref()
                    .filter(|to| to.family() != Family::Unspec)
                    .or(peer.as_ref())
                    .and_then(|to| to.to_std())
                    .ok_or(Error::NoAddress)?;
                s.send_to(&op.buf, target).await.map_err(Error::from)
            }
        }
    }
}

async fn recv_loop(sock: Arc<PalSocket>, mut reader: Reader) {
    let mut closed = sock.closed_tx.subscribe();
    loop {
        if !wait_enabled(&sock.recv_enabled, &sock.recv_wake, &mut closed).await {
            break;
        }
        let Some(events) = sock.events() else { break };
        let Some(mut buf) = events.begin_recv() else {
            // Pool exhausted: park until flow control re-enables us.
            sock.recv_enabled.store(false, Ordering::Release);
            continue;
        };
        let result = tokio::select! {
            biased;
            _ = closed.changed() => Err(Error::Aborted),
            r = reader.read_into(&mut buf) => r,
        };
        match result {
            Ok(from) => {
                if buf.is_empty() && reader.is_stream() {
                    // Orderly remote shutdown.
                    events.end_recv(buf, None, Err(Error::Closed));
                    break;
                }
                events.end_recv(buf, from, Ok(()));
            }
            Err(Error::Aborted) => {
                events.end_recv(buf, None, Err(Error::Aborted));
                break;
            }
            Err(e) => {
                let fatal = reader.is_stream() || matches!(e, Error::Closed | Error::Reset);
                events.end_recv(buf, None, Err(e));
                if fatal {
                    break;
                }
            }
        }
    }
    trace!("recv loop done");
}

async fn send_loop(sock: Arc<PalSocket>, mut writer: Writer) {
    let mut closed = sock.closed_tx.subscribe();
    loop {
        if !wait_enabled(&sock.send_enabled, &sock.send_wake, &mut closed).await {
            break;
        }
        let Some(events) = sock.events() else { break };
        let Some(op) = events.begin_send() else {
            // No data pending: disable until the owner queues more.
            sock.send_enabled.store(false, Ordering::Release);
            continue;
        };
        let peer = sock.peer.lock().unwrap().clone();
        let result = tokio::select! {
            biased;
            _ = closed.changed() => Err(Error::Aborted),
            r = writer.write_op(&op, peer) => r,
        };
        match result {
            Ok(sent) => events.end_send(sent, Ok(())),
            Err(Error::Aborted) => {
                events.end_send(0, Err(Error::Aborted));
                break;
            }
            Err(e) => {
                let fatal = matches!(writer, Writer::Stream(_))
                    || matches!(e, Error::Closed | Error::Reset);
                events.end_send(0, Err(e));
                if fatal {
                    break;
                }
            }
        }
    }
    trace!("send loop done");
}

async fn accept_loop(sock: Arc<PalSocket>, acceptor: Acceptor) {
    let mut closed = sock.closed_tx.subscribe();
    loop {
        if !wait_enabled(&sock.recv_enabled, &sock.recv_wake, &mut closed).await {
            break;
        }
        let Some(events) = sock.events() else { break };
        let Some(itf) = events.begin_accept() else {
            sock.recv_enabled.store(false, Ordering::Release);
            continue;
        };
        let accepted = tokio::select! {
            biased;
            _ = closed.changed() => Err(Error::Aborted),
            r = accept_one(&acceptor, itf) => r,
        };
        match accepted {
            Ok(new_sock) => {
                info!(peer = ?new_sock.getpeername().ok(), "accepted connection");
                events.end_accept(Ok(new_sock));
            }
            Err(Error::Aborted) => {
                events.end_accept(Err(Error::Aborted));
                break;
            }
            Err(e) => {
                warn!(err = %e, "accept failed");
                events.end_accept(Err(e));
            }
        }
    }
    trace!("accept loop done");
}

async fn accept_one(acceptor: &Acceptor, itf: AcceptItf) -> Result<Arc<PalSocket>> {
    match acceptor {
        Acceptor::Tcp(listener) => {
            let (stream, _) = listener.accept().await.map_err(Error::from)?;
            PalSocket::adopt_tcp(itf.props, itf.events, stream)
        }
        #[cfg(unix)]
        Acceptor::Unix(listener) => {
            let (stream, _) = listener.accept().await.map_err(Error::from)?;
            PalSocket::adopt_unix(itf.props, itf.events, stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::net::Protocol;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt as _;

    /// Records every callback; queues one send op at a time.
    struct TestClient {
        opened: StdMutex<Option<Result<()>>>,
        received: StdMutex<Vec<u8>>,
        sent: StdMutex<Vec<usize>>,
        to_send: StdMutex<Vec<SendOp>>,
        closed: AtomicBool,
        notify: Notify,
    }

    impl TestClient {
        fn new() -> Arc<TestClient> {
            Arc::new(TestClient {
                opened: StdMutex::new(None),
                received: StdMutex::new(Vec::new()),
                sent: StdMutex::new(Vec::new()),
                to_send: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            })
        }

        async fn wait(&self) {
            self.notify.notified().await;
        }
    }

    impl SocketEvents for TestClient {
        fn opened(&self, result: Result<()>) {
            *self.opened.lock().unwrap() = Some(result);
            self.notify.notify_one();
        }
        fn begin_send(&self) -> Option<SendOp> {
            self.to_send.lock().unwrap().pop()
        }
        fn end_send(&self, sent: usize, result: Result<()>) {
            if result.is_ok() {
                self.sent.lock().unwrap().push(sent);
                self.notify.notify_one();
            }
        }
        fn begin_recv(&self) -> Option<BytesMut> {
            Some(BytesMut::with_capacity(1024))
        }
        fn end_recv(&self, buf: BytesMut, _from: Option<SocketAddress>, result: Result<()>) {
            if result.is_ok() {
                self.received.lock().unwrap().extend_from_slice(&buf);
                self.notify.notify_one();
            }
        }
        fn closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    fn stream_props(addr: SocketAddress) -> SocketProps {
        SocketProps {
            family: Family::Inet,
            kind: SocketKind::Stream,
            protocol: Protocol::Tcp,
            flags: 0,
            address: addr,
            timeout: 0,
        }
    }

    #[tokio::test]
    async fn test_open_recv_close_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let client = TestClient::new();
        let events: Arc<dyn SocketEvents> = client.clone();
        let sock = PalSocket::create(
            stream_props(SocketAddress::from_std(addr)),
            Arc::downgrade(&events),
        );
        sock.open().unwrap();
        client.wait().await;
        assert!(client.opened.lock().unwrap().as_ref().unwrap().is_ok());

        sock.can_recv(true);
        while client.received.lock().unwrap().len() < 5 {
            client.wait().await;
        }
        assert_eq!(&*client.received.lock().unwrap(), b"hello");

        sock.close();
        while !client.closed.load(Ordering::SeqCst) {
            client.wait().await;
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_loop_drains_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf).await.unwrap();
            buf
        });

        let client = TestClient::new();
        client.to_send.lock().unwrap().push(SendOp {
            buf: bytes::Bytes::from_static(b"abcde"),
            to: None,
        });
        let events: Arc<dyn SocketEvents> = client.clone();
        let sock = PalSocket::create(
            stream_props(SocketAddress::from_std(addr)),
            Arc::downgrade(&events),
        );
        sock.open().unwrap();
        client.wait().await;

        sock.can_send(true);
        while client.sent.lock().unwrap().is_empty() {
            client.wait().await;
        }
        assert_eq!(server.await.unwrap(), b"abcde");
        sock.close();
    }

    #[tokio::test]
    async fn test_open_refused_reports_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TestClient::new();
        let events: Arc<dyn SocketEvents> = client.clone();
        let sock = PalSocket::create(
            stream_props(SocketAddress::from_std(addr)),
            Arc::downgrade(&events),
        );
        sock.open().unwrap();
        client.wait().await;
        assert!(client.opened.lock().unwrap().as_ref().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_pair_is_connected_both_ways() {
        let a = TestClient::new();
        let b = TestClient::new();
        a.to_send.lock().unwrap().push(SendOp {
            buf: bytes::Bytes::from_static(b"ping"),
            to: None,
        });
        let (ea, eb): (Arc<dyn SocketEvents>, Arc<dyn SocketEvents>) = (a.clone(), b.clone());
        let (sa, sb) = PalSocket::pair(
            SocketProps::default(),
            Arc::downgrade(&ea),
            SocketProps::default(),
            Arc::downgrade(&eb),
        );
        a.wait().await;
        sa.can_send(true);
        sb.can_recv(true);
        while b.received.lock().unwrap().len() < 4 {
            b.wait().await;
        }
        assert_eq!(&*b.received.lock().unwrap(), b"ping");
        sa.close();
        sb.close();
    }

    #[tokio::test]
    async fn test_double_open_is_bad_state() {
        let client = TestClient::new();
        let events: Arc<dyn SocketEvents> = client.clone();
        let sock = PalSocket::create(
            stream_props(SocketAddress::Inet {
                addr: [127, 0, 0, 1],
                port: 9,
            }),
            Arc::downgrade(&events),
        );
        sock.open().unwrap();
        assert_eq!(sock.open().unwrap_err(), Error::BadState);
    }
}
