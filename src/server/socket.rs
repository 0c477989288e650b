// SPDX-License-Identifier: MIT
//! Per-socket state machine.
//!
//! A [`ServerSocket`] is the state-bearing entity of the engine: one entry
//! in the socket table, one platform socket, one stream. Its life is
//! `created → opened → collect → closing → closed`, driven from three
//! sides — control messages, stream messages, and platform completions —
//! all serialized on the socket's scheduler except the completion callbacks,
//! which only append to the queue pairs under their locks.
//!
//! Queue layout (two locks, two disjoint pairs):
//!   send side: `send_queue` (stream → platform) and `write_queue`
//!              (responses bound for the stream)
//!   recv side: `recv_queue` (platform → stream) and `read_queue`
//!              (parked poll requests, polled mode only)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use tracing::{debug, error, info, trace};

use crate::err::{Error, Result, ER_OK};
use crate::io::codec::CodecId;
use crate::io::message::{Message, MessageKind, Payload, LINK_VERSION};
use crate::io::pool::MessageFactory;
use crate::io::reference::Reference;
use crate::ns::NsEntry;
use crate::pal::net::{Family, SocketAddress};
use crate::pal::{AcceptItf, PalSocket, SendOp, SockOpt, SocketEvents, SocketProps};
use crate::sched::{ticks_ms, SchedulerHandle};
use crate::server::ProxyServer;
use crate::transport::{Connection, ConnectionEvent, EventHandler};

// Receive pool sizing.
const RECV_POOL_MIN: usize = 4;
const RECV_POOL_MAX: usize = 0x20000;
const RECV_POOL_LWM: usize = 1;
const RECV_POOL_HWM: usize = 1;
const DEFAULT_BUFFER_SIZE: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    Created,
    Opened,
    Collect,
    Closing,
    Closed,
}

/// Stream carrier: the shared control listener, or a private connection.
pub(crate) enum StreamBinding {
    Shared,
    Private(Arc<Connection>),
}

#[derive(Default)]
struct SendSide {
    /// Data bound for the platform socket.
    send_queue: VecDeque<Message>,
    /// Responses bound for the stream.
    write_queue: VecDeque<Message>,
}

#[derive(Default)]
struct RecvSide {
    /// Data received from the platform socket, awaiting delivery.
    recv_queue: VecDeque<Message>,
    /// Parked poll requests, with absolute deadlines. Polled mode only.
    read_queue: VecDeque<Message>,
}

pub(crate) struct ServerSocket {
    pub(crate) id: Reference,
    owner: Reference,
    server: Weak<ProxyServer>,
    weak: Weak<ServerSocket>,
    pub(crate) sched: Arc<SchedulerHandle>,

    state: Mutex<SocketState>,
    props: Mutex<SocketProps>,
    sock: Mutex<Option<Arc<PalSocket>>>,
    stream: Mutex<Option<StreamBinding>>,
    stream_id: Mutex<Reference>,
    polled: AtomicBool,
    buffer_size: AtomicUsize,
    factory: Mutex<Option<Arc<MessageFactory>>>,

    last_activity: AtomicU64,
    time_opened: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recvd: AtomicU64,
    last_error: Mutex<Option<Error>>,

    /// Parked link request awaiting the platform open completion.
    link_message: Mutex<Option<Message>>,

    send_side: Mutex<SendSide>,
    recv_side: Mutex<RecvSide>,

    // One in-flight platform operation per direction.
    pending_send: Mutex<Option<Message>>,
    pending_recv: Mutex<Option<Message>>,
    pending_accept: Mutex<Option<Arc<ServerSocket>>>,
}

impl ServerSocket {
    /// Allocate a socket, register it in the server's table, and give it a
    /// child scheduler. State starts at `created`.
    pub(crate) fn create(server: &Arc<ProxyServer>, owner: Reference) -> Arc<ServerSocket> {
        let sock = Arc::new_cyclic(|weak| ServerSocket {
            id: Reference::random(),
            owner,
            server: Arc::downgrade(server),
            weak: weak.clone(),
            sched: server.sched.child(),
            state: Mutex::new(SocketState::Created),
            props: Mutex::new(SocketProps::default()),
            sock: Mutex::new(None),
            stream: Mutex::new(None),
            stream_id: Mutex::new(Reference::NULL),
            polled: AtomicBool::new(false),
            buffer_size: AtomicUsize::new(DEFAULT_BUFFER_SIZE),
            factory: Mutex::new(None),
            last_activity: AtomicU64::new(0),
            time_opened: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recvd: AtomicU64::new(0),
            last_error: Mutex::new(None),
            link_message: Mutex::new(None),
            send_side: Mutex::new(SendSide::default()),
            recv_side: Mutex::new(RecvSide::default()),
            pending_send: Mutex::new(None),
            pending_recv: Mutex::new(None),
            pending_accept: Mutex::new(None),
        });
        server.insert(sock.clone());
        sock
    }

    /// Queue a delivery pass on the socket's scheduler.
    fn schedule_delivery(&self) {
        let weak = self.weak.clone();
        self.sched.queue("deliver", move || {
            if let Some(sock) = weak.upgrade() {
                sock.deliver_results();
            }
        });
    }

    // ── Small accessors ──────────────────────────────────────────────────────

    pub(crate) fn state(&self) -> SocketState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn pal(&self) -> Option<Arc<PalSocket>> {
        self.sock.lock().unwrap().clone()
    }

    pub(crate) fn set_pal(&self, sock: Arc<PalSocket>) {
        *self.sock.lock().unwrap() = Some(sock);
    }

    pub(crate) fn props(&self) -> SocketProps {
        self.props.lock().unwrap().clone()
    }

    pub(crate) fn set_props(&self, props: SocketProps) {
        *self.props.lock().unwrap() = props;
    }

    pub(crate) fn timeout(&self) -> u64 {
        self.props.lock().unwrap().timeout
    }

    pub(crate) fn set_timeout(&self, timeout: u64) {
        self.props.lock().unwrap().timeout = timeout;
    }

    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(ticks_ms(), Ordering::Release);
    }

    fn stream_id(&self) -> Reference {
        *self.stream_id.lock().unwrap()
    }

    fn is_polled(&self) -> bool {
        self.polled.load(Ordering::Acquire)
    }

    fn factory(&self) -> Option<Arc<MessageFactory>> {
        self.factory.lock().unwrap().clone()
    }

    pub(crate) fn park_link_message(&self, message: Message) {
        *self.link_message.lock().unwrap() = Some(message);
    }

    /// The connection carrying this socket's stream, if any.
    fn stream_conn(&self) -> Option<Arc<Connection>> {
        match &*self.stream.lock().unwrap() {
            Some(StreamBinding::Shared) => self.server.upgrade().and_then(|s| s.listener()),
            Some(StreamBinding::Private(conn)) => Some(conn.clone()),
            None => None,
        }
    }

    /// Detach the stream binding; a private connection is returned so the
    /// worker can close it.
    pub(crate) fn take_stream(&self) -> Option<Arc<Connection>> {
        match self.stream.lock().unwrap().take() {
            Some(StreamBinding::Private(conn)) => Some(conn),
            _ => None,
        }
    }

    fn poke_worker(&self) {
        if let Some(server) = self.server.upgrade() {
            server.poke_worker();
        }
    }

    // ── Queue maintenance ────────────────────────────────────────────────────

    /// Clear the platform-side queues (pending sends and undelivered data).
    pub(crate) fn empty_socket_queues(&self) {
        self.send_side.lock().unwrap().send_queue.clear();
        self.recv_side.lock().unwrap().recv_queue.clear();
    }

    /// Clear the transport-side queues (responses and parked polls).
    pub(crate) fn empty_transport_queues(&self) {
        self.send_side.lock().unwrap().write_queue.clear();
        self.recv_side.lock().unwrap().read_queue.clear();
    }

    /// True while data is still in flight on either platform queue.
    pub(crate) fn queues_busy(&self) -> bool {
        !self.send_side.lock().unwrap().send_queue.is_empty()
            || !self.recv_side.lock().unwrap().recv_queue.is_empty()
    }

    /// Synthesize a local close notification toward the stream; used by the
    /// worker when an idle socket is collected.
    pub(crate) fn push_local_close(&self) -> Result<()> {
        let factory = self.factory().ok_or(Error::BadState)?;
        let message = factory.create(self.id, self.stream_id(), Payload::CloseRequest)?;
        self.recv_side.lock().unwrap().recv_queue.push_back(message);
        Ok(())
    }

    /// Answer parked poll requests: all of them on `close`, otherwise the
    /// ones whose deadline has passed.
    pub(crate) fn manage_read_queue(&self, close: bool) {
        let now = ticks_ms();
        let expired: Vec<Message> = {
            let mut recv = self.recv_side.lock().unwrap();
            let mut keep = VecDeque::new();
            let mut expired = Vec::new();
            for message in recv.read_queue.drain(..) {
                let deadline = match &message.payload {
                    Payload::PollRequest { timeout, .. } => *timeout,
                    _ => 0,
                };
                if close || deadline <= now {
                    expired.push(message);
                } else {
                    keep.push_back(message);
                }
            }
            recv.read_queue = keep;
            expired
        };
        if expired.is_empty() {
            return;
        }
        let conn = self.stream_conn();
        for message in expired {
            let mut response = message.as_response();
            response.set_error(Some(if close { Error::Closed } else { Error::Timeout }));
            match &conn {
                Some(conn) => {
                    if let Err(e) = conn.send(&response) {
                        error!(err = %e, "failed to send poll response, dropping message");
                    }
                }
                None => debug!("no stream for poll response, dropping"),
            }
        }
    }

    // ── Delivery (§ results to the stream) ───────────────────────────────────

    /// Push queued results to the stream. Phase 1 drains responses,
    /// piggybacking received data onto successful poll responses; phase 2
    /// drains received data, pairing each message with a parked poll in
    /// polled mode. A transport failure pushes everything back and stops.
    pub(crate) fn deliver_results(&self) {
        let state = self.state();
        if state != SocketState::Opened && state != SocketState::Collect {
            debug!(state = ?state, "no deliveries in this state");
            return;
        }
        let Some(server) = self.server.upgrade() else { return };
        let proxy_id = server.id;
        let polled = self.is_polled();

        // Phase 1: responses, with piggybacked data where possible.
        loop {
            let Some(poll_message) = self.send_side.lock().unwrap().write_queue.pop_front()
            else {
                break;
            };
            let mut data_message = None;
            if polled
                && poll_message.kind() == MessageKind::Poll
                && poll_message.error_code == ER_OK
            {
                data_message = self.recv_side.lock().unwrap().recv_queue.pop_front();
                if let Some(message) = &mut data_message {
                    message.correlation_id = poll_message.correlation_id;
                    message.proxy = proxy_id;
                    message.target = self.stream_id();
                    message.source = self.id;
                }
            }

            let send_result = match self.stream_conn() {
                Some(conn) => conn.send(data_message.as_ref().unwrap_or(&poll_message)),
                None => Err(Error::Closed),
            };
            if let Err(e) = send_result {
                error!(err = %e, "failed to write response to stream");
                // Undo: back to the heads to try again later.
                self.send_side
                    .lock()
                    .unwrap()
                    .write_queue
                    .push_front(poll_message);
                if let Some(message) = data_message {
                    self.recv_side.lock().unwrap().recv_queue.push_front(message);
                }
                break;
            }
        }

        // Phase 2: received data.
        loop {
            let (mut message, poll_message) = {
                let mut recv = self.recv_side.lock().unwrap();
                if polled && recv.read_queue.is_empty() {
                    break;
                }
                let Some(message) = recv.recv_queue.pop_front() else { break };
                let poll_message = if polled { recv.read_queue.pop_front() } else { None };
                (message, poll_message)
            };
            if let Some(poll) = &poll_message {
                message.correlation_id = poll.correlation_id;
            }
            message.proxy = proxy_id;
            message.target = self.stream_id();
            if message.kind() != MessageKind::Link {
                // Accept notifications keep the accepted socket as source;
                // everything else originates from this socket.
                message.source = self.id;
            }

            let send_result = match self.stream_conn() {
                Some(conn) => conn.send(&message),
                None => Err(Error::Closed),
            };
            if let Err(e) = send_result {
                error!(err = %e, "failed to write received message to stream");
                let mut recv = self.recv_side.lock().unwrap();
                recv.recv_queue.push_front(message);
                if let Some(poll) = poll_message {
                    recv.read_queue.push_front(poll);
                }
                break;
            }
        }
    }

    // ── Control handlers (on the socket's scheduler) ─────────────────────────

    /// Dispatch a message that arrived addressed to this socket on the
    /// control listener (or a private polled stream).
    pub(crate) fn control_message(self: &Arc<Self>, message: Message) {
        let responder = self.server.upgrade().and_then(|s| s.listener());
        match message.kind() {
            MessageKind::Open => {
                if let Some(responder) = responder {
                    self.handle_open(message, responder);
                }
            }
            MessageKind::Data => self.handle_data(message, responder),
            MessageKind::Poll => self.handle_poll(message, responder),
            MessageKind::Close => self.handle_close(message, responder),
            MessageKind::SetOpt => self.handle_setopt(message, responder),
            MessageKind::GetOpt => self.handle_getopt(message, responder),
            other => {
                error!(kind = ?other, "bad message type for socket");
                if let Some(responder) = responder {
                    let mut response = message.as_response();
                    response.set_error(Some(Error::NotSupported));
                    let _ = responder.send(&response);
                }
            }
        }
    }

    /// Events from a private polled stream: requests take the control path,
    /// connection-state events take the stream path.
    pub(crate) fn on_control_event(self: &Arc<Self>, ev: ConnectionEvent) {
        match ev {
            ConnectionEvent::Received(message) => self.control_message(message),
            other => self.on_stream_event(other),
        }
    }

    /// Events from a private streaming connection. Responses (the close
    /// handshake, post-close errors) go back out on the stream itself.
    pub(crate) fn on_stream_event(self: &Arc<Self>, ev: ConnectionEvent) {
        match ev {
            ConnectionEvent::Received(message) => match message.kind() {
                MessageKind::Close => self.handle_close(message, self.stream_conn()),
                MessageKind::Poll => self.handle_poll(message, self.stream_conn()),
                MessageKind::Data => self.handle_data(message, self.stream_conn()),
                other => error!(kind = ?other, "unexpected message type on stream"),
            },
            ConnectionEvent::Reconnecting(e) => {
                if e == Error::Closed || e == Error::Reset {
                    // Remote side hung up: cancel the entire stream.
                    self.set_state(SocketState::Created);
                } else {
                    error!(err = %e, "stream connection error, collecting socket");
                    self.set_state(SocketState::Collect);
                }
                self.poke_worker();
            }
            ConnectionEvent::Closed => {
                trace!("stream closed");
            }
        }
    }

    fn handle_open(self: &Arc<Self>, message: Message, responder: Arc<Connection>) {
        let Payload::OpenRequest {
            stream_id,
            polled,
            connection_string,
            encoding,
            cs_type,
            max_recv,
        } = message.payload.clone()
        else {
            return;
        };

        let result = self.do_open(stream_id, polled, &connection_string, encoding, cs_type, max_recv);
        if let Err(e) = &result {
            error!(err = %e, "failed to handle open message");
            self.set_state(SocketState::Created);
            self.poke_worker();
        } else {
            info!(id = %self.id, polled, "socket open");
        }

        // Exactly one response, success or failure.
        let mut response = message.into_response(Payload::OpenResponse);
        response.set_error(result.err());
        response.target = self.owner;
        response.source = self.id;
        if let Err(e) = responder.send(&response) {
            error!(err = %e, "failed sending open response");
        }
    }

    fn do_open(
        self: &Arc<Self>,
        stream_id: Reference,
        polled: bool,
        connection_string: &str,
        encoding: u32,
        cs_type: u32,
        max_recv: u64,
    ) -> Result<()> {
        match self.state() {
            SocketState::Opened => return Err(Error::BadState),
            SocketState::Created => {}
            _ => return Err(Error::Closed),
        }

        *self.stream_id.lock().unwrap() = stream_id;
        self.polled.store(polled, Ordering::Release);

        // Choose receive framing: explicit, else the socket's buffer, else 64k.
        let mut buffer_size = max_recv as usize;
        if buffer_size == 0 {
            buffer_size = match self.pal().map(|p| p.getsockopt(SockOpt::Rcvbuf)) {
                Some(Ok(v)) if v > 0 => v as usize,
                Some(Err(e)) => {
                    if e != Error::NotSupported {
                        error!(err = %e, "failed to read receive buffer size, using default");
                    }
                    DEFAULT_BUFFER_SIZE
                }
                _ => DEFAULT_BUFFER_SIZE,
            };
        }
        self.buffer_size.store(buffer_size, Ordering::Release);
        let pool_size = (RECV_POOL_MAX / buffer_size).max(RECV_POOL_MIN);

        // Receive pool; its watermarks throttle the platform read loop.
        let weak = Arc::downgrade(self);
        let factory = MessageFactory::new(
            pool_size,
            RECV_POOL_LWM,
            pool_size - RECV_POOL_HWM,
            Some(Box::new(move |low| {
                if let Some(sock) = weak.upgrade() {
                    if sock.state() == SocketState::Opened {
                        if let Some(pal) = sock.pal() {
                            pal.can_recv(!low);
                        }
                    }
                }
            })),
        );
        *self.factory.lock().unwrap() = Some(factory);

        let server = self.server.upgrade().ok_or(Error::Shutdown)?;
        let binding = if !connection_string.is_empty() {
            if cs_type != 0 {
                error!(cs_type, "connection string type not supported");
                return Err(Error::NotSupported);
            }
            let codec = CodecId::from_u32(encoding).ok_or_else(|| {
                error!(encoding, "stream encoding not supported");
                Error::NotSupported
            })?;
            let cs = connection_string.parse()?;
            let entry = NsEntry::new_link(stream_id, &cs);
            let conn = if polled {
                // Polled streams post into the control path.
                let weak = Arc::downgrade(self);
                let handler: EventHandler = Arc::new(move |ev| {
                    if let Some(sock) = weak.upgrade() {
                        sock.on_control_event(ev);
                    }
                });
                server
                    .transport()
                    .create(&entry, codec, handler, self.sched.clone())?
            } else {
                // Streaming needs the WebSocket-capable transport.
                let ws = server.ws_transport().ok_or(Error::NotSupported)?;
                let weak = Arc::downgrade(self);
                let handler: EventHandler = Arc::new(move |ev| {
                    if let Some(sock) = weak.upgrade() {
                        sock.on_stream_event(ev);
                    }
                });
                ws.create(&entry, codec, handler, self.sched.clone())?
            };
            StreamBinding::Private(conn)
        } else if polled {
            // No connection string: alias the server's control listener.
            StreamBinding::Shared
        } else {
            error!("open request had no connection string but polled was false");
            return Err(Error::InvalidFormat);
        };
        *self.stream.lock().unwrap() = Some(binding);

        // Start data flowing.
        if let Some(pal) = self.pal() {
            pal.can_recv(true);
        }
        self.time_opened.store(ticks_ms(), Ordering::Release);
        self.touch();
        self.set_state(SocketState::Opened);
        Ok(())
    }

    fn handle_data(self: &Arc<Self>, message: Message, responder: Option<Arc<Connection>>) {
        if self.state() != SocketState::Opened {
            info!("received data after close");
            // Answer with closed on whatever responder carried the request;
            // without one the message is swallowed.
            if let Some(responder) = responder {
                let mut response = message.as_response();
                response.set_error(Some(Error::Closed));
                if let Err(e) = responder.send(&response) {
                    error!(err = %e, "failed to send error response");
                }
            }
            return;
        }
        self.send_side.lock().unwrap().send_queue.push_back(message);
        if let Some(pal) = self.pal() {
            pal.can_send(true);
        }
    }

    fn handle_poll(self: &Arc<Self>, message: Message, responder: Option<Arc<Connection>>) {
        if self.state() != SocketState::Opened {
            if let Some(responder) = responder {
                let mut response = message.as_response();
                response.set_error(Some(Error::Closed));
                if let Err(e) = responder.send(&response) {
                    error!(err = %e, "failed to send poll error response");
                }
            }
            return;
        }
        let (sequence_number, timeout) = match &message.payload {
            Payload::PollRequest {
                sequence_number,
                timeout,
            } => (*sequence_number, *timeout),
            _ => return,
        };

        // A poll stretches the gc timeout and doubles as a stream keepalive.
        let now = ticks_ms();
        self.set_timeout(timeout.saturating_mul(3));
        self.touch();

        if !self.is_polled() {
            return;
        }

        let mut parked = message;
        parked.payload = Payload::PollRequest {
            sequence_number,
            timeout: now + timeout, // absolute, so expiry can gc it
        };
        self.recv_side.lock().unwrap().read_queue.push_back(parked);

        // One delivery pass; if polls are still parked, flow on and arm the
        // expiry timer.
        self.deliver_results();
        if !self.recv_side.lock().unwrap().read_queue.is_empty() {
            if let Some(pal) = self.pal() {
                pal.can_recv(true);
            }
            let weak = Arc::downgrade(self);
            self.sched.defer("poll_timeout", timeout, move || {
                if let Some(sock) = weak.upgrade() {
                    sock.manage_read_queue(false);
                }
            });
        }
    }

    fn handle_close(self: &Arc<Self>, message: Message, responder: Option<Arc<Connection>>) {
        let state = self.state();
        let ok = state == SocketState::Created || state == SocketState::Opened;
        if ok {
            debug!(id = %self.id, "server socket asked to close");
            self.set_state(SocketState::Collect);
            self.poke_worker();
        }
        let payload = Payload::CloseResponse {
            time_open: ticks_ms().saturating_sub(self.time_opened.load(Ordering::Acquire)),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            bytes_received: self.bytes_recvd.load(Ordering::Acquire),
            error_code: if ok { ER_OK } else { Error::Closed.code() },
        };
        if let Some(responder) = responder {
            let response = message.into_response(payload);
            if let Err(e) = responder.send(&response) {
                error!(err = %e, "failed sending close response");
            }
        }
    }

    fn handle_setopt(self: &Arc<Self>, message: Message, responder: Option<Arc<Connection>>) {
        let result = (|| -> Result<()> {
            let state = self.state();
            if state != SocketState::Created && state != SocketState::Opened {
                return Err(Error::Closed);
            }
            self.touch();
            let Payload::SetOptRequest { so_val } = &message.payload else {
                return Err(Error::Arg);
            };
            match so_val.opt {
                SockOpt::IpMulticastJoin => {
                    let mcast = so_val.mcast.as_ref().ok_or(Error::Arg)?;
                    self.pal().ok_or(Error::BadState)?.join_multicast_group(mcast)?;
                    trace!("joined multicast group");
                    Ok(())
                }
                SockOpt::IpMulticastLeave => {
                    let mcast = so_val.mcast.as_ref().ok_or(Error::Arg)?;
                    self.pal().ok_or(Error::BadState)?.leave_multicast_group(mcast)?;
                    trace!("left multicast group");
                    Ok(())
                }
                SockOpt::PropsTimeout => {
                    self.set_timeout(so_val.value);
                    trace!(timeout = so_val.value, "wrote socket gc timeout");
                    Ok(())
                }
                opt => {
                    self.pal().ok_or(Error::BadState)?.setsockopt(opt, so_val.value)?;
                    trace!(?opt, value = so_val.value, "wrote socket option");
                    Ok(())
                }
            }
        })();

        if let Err(e) = &result {
            error!(err = %e, "failed to handle set option message");
        }
        if let Some(responder) = responder {
            let mut response = message.into_response(Payload::SetOptResponse);
            response.set_error(result.err());
            if let Err(e) = responder.send(&response) {
                error!(err = %e, "failed sending set option response");
            }
        }
    }

    fn handle_getopt(self: &Arc<Self>, message: Message, responder: Option<Arc<Connection>>) {
        let Some(responder) = responder else { return };
        let so_opt = match &message.payload {
            Payload::GetOptRequest { so_opt } => *so_opt,
            _ => return,
        };
        let result = (|| -> Result<u64> {
            let state = self.state();
            if state != SocketState::Created && state != SocketState::Opened {
                return Err(Error::Closed);
            }
            self.touch();
            match so_opt {
                SockOpt::IpMulticastJoin | SockOpt::IpMulticastLeave => Err(Error::NotSupported),
                SockOpt::PropsTimeout => Ok(self.timeout()),
                opt => {
                    let value = self.pal().ok_or(Error::BadState)?.getsockopt(opt)?;
                    trace!(?opt, value, "read socket option");
                    Ok(value)
                }
            }
        })();

        let payload = Payload::GetOptResponse {
            so_val: crate::pal::SockOptValue {
                opt: so_opt,
                value: *result.as_ref().unwrap_or(&0),
                mcast: None,
            },
        };
        if let Err(e) = &result {
            error!(err = %e, "failed to handle get option message");
        }
        let mut response = message.into_response(payload);
        response.set_error(result.err());
        if let Err(e) = responder.send(&response) {
            error!(err = %e, "failed sending get option response");
        }
    }

    // ── Platform completions (scheduler side) ────────────────────────────────

    /// Send the parked link response once the platform open resolves.
    fn open_complete(self: &Arc<Self>) {
        let Some(message) = self.link_message.lock().unwrap().take() else {
            return;
        };
        let result = self.last_error.lock().unwrap().take();

        let payload = if result.is_none() {
            let local = self
                .pal()
                .and_then(|p| p.getsockname().ok())
                .unwrap_or(SocketAddress::Unspec);
            let peer = self
                .pal()
                .and_then(|p| p.getpeername().ok())
                .unwrap_or(SocketAddress::Unspec);
            Payload::LinkResponse {
                version: LINK_VERSION,
                link_id: self.id,
                local_address: local,
                peer_address: peer,
            }
        } else {
            Payload::LinkResponse {
                version: LINK_VERSION,
                link_id: Reference::NULL,
                local_address: SocketAddress::Unspec,
                peer_address: SocketAddress::Unspec,
            }
        };

        if let Some(e) = &result {
            error!(err = %e, "failed to link socket");
            self.set_state(SocketState::Created);
            self.poke_worker();
        }

        let mut response = message.into_response(payload);
        response.set_error(result);
        response.source = self.id;
        if let Some(responder) = self.server.upgrade().and_then(|s| s.listener()) {
            if let Err(e) = responder.send(&response) {
                error!(err = %e, "failed sending link response");
            }
        }
    }

    fn close_complete(self: &Arc<Self>) {
        self.touch();
        self.set_state(SocketState::Closed);
        debug!(id = %self.id, "server socket closed");
        self.poke_worker();
    }
}

// ─── Platform event callbacks ─────────────────────────────────────────────────

impl SocketEvents for ServerSocket {
    fn opened(&self, result: Result<()>) {
        *self.last_error.lock().unwrap() = result.err();
        // Completion runs on a platform task; hop onto the scheduler.
        let weak = self.weak.clone();
        self.sched.queue("open_complete", move || {
            if let Some(sock) = weak.upgrade() {
                sock.open_complete();
            }
        });
    }

    fn begin_send(&self) -> Option<SendOp> {
        let message = self.send_side.lock().unwrap().send_queue.pop_front()?;
        let Payload::Data {
            source_address,
            buffer,
            ..
        } = &message.payload
        else {
            // Only data belongs on the send queue.
            return None;
        };
        let op = SendOp {
            buf: buffer.clone(),
            to: (source_address.family() != Family::Unspec).then(|| source_address.clone()),
        };
        *self.pending_send.lock().unwrap() = Some(message);
        Some(op)
    }

    fn end_send(&self, sent: usize, result: Result<()>) {
        let Some(message) = self.pending_send.lock().unwrap().take() else {
            return;
        };
        let expected = match &message.payload {
            Payload::Data { buffer, .. } => buffer.len(),
            _ => 0,
        };
        let sequence_number = match &message.payload {
            Payload::Data { sequence_number, .. } => *sequence_number,
            _ => 0,
        };

        let mut result = result;
        match result {
            Err(Error::Retry) => {
                // Back to the front; the loop will come around again.
                trace!("retrying send");
                self.send_side.lock().unwrap().send_queue.push_front(message);
                return;
            }
            Err(Error::Aborted) => {
                debug!("send operation aborted");
                return;
            }
            Ok(()) => {
                if sent == expected {
                    self.touch();
                    self.bytes_sent.fetch_add(sent as u64, Ordering::AcqRel);
                    if !self.is_polled() {
                        // Streaming mode acks nothing on success.
                        return;
                    }
                } else {
                    result = Err(Error::Writing);
                }
            }
            Err(e) => {
                if e != Error::Closed && e != Error::Reset {
                    error!(err = %e, "failed send operation, returning error");
                }
            }
        }

        // Ack (polled) or error-report the send with a poll response.
        let mut response = message.as_response();
        response.payload = Payload::PollResponse {
            sequence_number,
            timeout: 0,
        };
        response.set_error(result.as_ref().err().copied());
        self.send_side.lock().unwrap().write_queue.push_back(response);
        self.schedule_delivery();

        if matches!(result, Err(Error::Closed) | Err(Error::Reset)) {
            info!("remote side closed, collecting socket");
            self.set_state(SocketState::Collect);
            self.poke_worker();
        }
    }

    fn begin_recv(&self) -> Option<BytesMut> {
        let factory = self.factory()?;
        let size = self.buffer_size.load(Ordering::Acquire);
        match factory.create_recv_buffer(self.id, self.stream_id(), size) {
            Ok((message, buffer)) => {
                *self.pending_recv.lock().unwrap() = Some(message);
                Some(buffer)
            }
            // Pool exhausted: the adapter parks until flow control resumes.
            Err(_) => None,
        }
    }

    fn end_recv(&self, buf: BytesMut, from: Option<SocketAddress>, result: Result<()>) {
        let Some(mut message) = self.pending_recv.lock().unwrap().take() else {
            return;
        };
        match &result {
            Err(Error::Aborted) | Err(Error::Retry) => return,
            Err(e @ (Error::Closed | Error::Reset)) => {
                info!(state = ?self.state(), err = %e, "remote close received");
                self.set_state(SocketState::Collect);
                self.poke_worker();
            }
            Err(e) => {
                error!(state = ?self.state(), err = %e, "failed receive operation");
            }
            Ok(()) => {}
        }

        let len = buf.len();
        message.payload = Payload::Data {
            sequence_number: 0,
            source_address: from.unwrap_or(SocketAddress::Unspec),
            buffer: buf.freeze(),
        };
        message.set_error(result.err());
        self.touch();
        self.bytes_recvd.fetch_add(len as u64, Ordering::AcqRel);
        self.recv_side.lock().unwrap().recv_queue.push_back(message);
        self.schedule_delivery();
    }

    fn begin_accept(&self) -> Option<AcceptItf> {
        let server = self.server.upgrade()?;
        let factory = self.factory()?;

        let accepted = ServerSocket::create(&server, self.owner);
        // Mint the link notification now; failing that fails the accept.
        match factory.create(
            self.id,
            self.stream_id(),
            Payload::LinkRequest {
                version: LINK_VERSION,
                props: SocketProps::default(),
            },
        ) {
            Ok(message) => accepted.park_link_message(message),
            Err(e) => {
                error!(err = %e, "failed to create link message");
                server.remove(&accepted.id);
                return None;
            }
        }
        accepted.set_props(self.props());

        let events: Weak<dyn SocketEvents> = accepted.weak.clone();
        let itf = AcceptItf {
            props: self.props(),
            events,
        };
        *self.pending_accept.lock().unwrap() = Some(accepted);
        Some(itf)
    }

    fn end_accept(&self, result: Result<Arc<PalSocket>>) {
        let Some(accepted) = self.pending_accept.lock().unwrap().take() else {
            return;
        };
        let server = self.server.upgrade();
        match result {
            Ok(pal) => {
                accepted.set_pal(pal.clone());
                let Some(mut message) = accepted.link_message.lock().unwrap().take() else {
                    return;
                };
                accepted.touch();
                self.touch();

                // Report the accepted endpoint's effective properties.
                let mut props = pal.get_properties();
                if let Ok(peer) = pal.getpeername() {
                    props.address = peer;
                }
                accepted.set_props(props.clone());
                message.payload = Payload::LinkRequest {
                    version: LINK_VERSION,
                    props,
                };
                message.source = accepted.id;

                self.recv_side.lock().unwrap().recv_queue.push_back(message);
                self.schedule_delivery();
            }
            Err(Error::Aborted) => {
                if let Some(server) = server {
                    server.remove(&accepted.id);
                }
            }
            Err(e) => {
                error!(err = %e, "failed to accept new socket");
                if let Some(server) = server {
                    server.remove(&accepted.id);
                }
            }
        }
    }

    fn closed(&self) {
        let weak = self.weak.clone();
        self.sched.queue("close_complete", move || {
            if let Some(sock) = weak.upgrade() {
                sock.close_complete();
            }
        });
    }
}
