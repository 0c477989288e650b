//! Platform socket layer.
//!
//! [`PalSocket`] presents one uniform, callback-driven contract over every
//! socket the engine owns: TCP and UDP in both families, raw sockets, Unix
//! domain sockets, passive listeners, and in-process pairs. The owner hands
//! in a [`SocketEvents`] implementation; the adapter runs a send loop and a
//! receive (or accept) loop and drives the owner through paired
//! `begin_*`/`end_*` calls. A producer callback returning `None` parks the
//! corresponding loop until it is re-enabled with
//! [`PalSocket::can_send`]/[`PalSocket::can_recv`].

pub mod net;
pub mod sock;

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::err::Result;
use net::{Family, Protocol, SocketAddress, SocketKind};
pub use sock::PalSocket;

// ─── Socket properties ────────────────────────────────────────────────────────

/// Effective properties of a socket: what to open, where, and how long it
/// may sit idle before the garbage collector takes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketProps {
    pub family: Family,
    pub kind: SocketKind,
    pub protocol: Protocol,
    pub flags: u32,
    pub address: SocketAddress,
    /// Inactivity timeout in milliseconds; 0 means unset.
    pub timeout: u64,
}

impl Default for SocketProps {
    fn default() -> Self {
        SocketProps {
            family: Family::Unspec,
            kind: SocketKind::Stream,
            protocol: Protocol::Unspec,
            flags: 0,
            address: SocketAddress::Unspec,
            timeout: 0,
        }
    }
}

impl SocketProps {
    pub fn is_passive(&self) -> bool {
        self.flags & net::flags::PASSIVE != 0
    }

    pub fn is_internal(&self) -> bool {
        self.flags & net::flags::INTERNAL != 0
    }
}

// ─── Socket options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SockOpt {
    ReuseAddr,
    Broadcast,
    Keepalive,
    Linger,
    Sndbuf,
    Rcvbuf,
    Nodelay,
    Ttl,
    /// The socket's effective gc timeout — engine state, not a kernel option.
    PropsTimeout,
    IpMulticastJoin,
    IpMulticastLeave,
}

/// Multicast group membership parameters for join/leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticastOption {
    pub address: SocketAddress,
    pub interface_index: u32,
}

/// An option with its value, as carried by setopt/getopt messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SockOptValue {
    pub opt: SockOpt,
    #[serde(default)]
    pub value: u64,
    #[serde(default)]
    pub mcast: Option<MulticastOption>,
}

// ─── Event interface ──────────────────────────────────────────────────────────

/// One outbound transmission: payload bytes and, for datagrams, the target.
#[derive(Debug)]
pub struct SendOp {
    pub buf: Bytes,
    pub to: Option<SocketAddress>,
}

/// Client interface for a socket about to be accepted on a listener.
pub struct AcceptItf {
    pub props: SocketProps,
    pub events: Weak<dyn SocketEvents>,
}

/// Callback contract between a socket and its owner.
///
/// `begin_send`/`begin_recv`/`begin_accept` are producer calls made from the
/// adapter's loops; returning `None` parks the loop. `end_*` report each
/// operation's outcome. All callbacks are synchronous — owners hand follow-up
/// work to their scheduler.
pub trait SocketEvents: Send + Sync {
    /// Open sequence finished.
    fn opened(&self, result: Result<()>);

    /// Produce the next buffer to transmit; `None` disables the send loop.
    fn begin_send(&self) -> Option<SendOp>;

    /// Transmission outcome for the buffer from the last `begin_send`.
    fn end_send(&self, sent: usize, result: Result<()>);

    /// Produce an empty buffer to fill; `None` parks the receive loop.
    fn begin_recv(&self) -> Option<BytesMut>;

    /// Filled buffer, datagram peer (when applicable), and outcome.
    fn end_recv(&self, buf: BytesMut, from: Option<SocketAddress>, result: Result<()>);

    /// Produce the client interface for the next incoming connection;
    /// `None` parks the accept loop.
    fn begin_accept(&self) -> Option<AcceptItf> {
        None
    }

    /// Accept outcome: the already-open socket for the new connection.
    fn end_accept(&self, result: Result<Arc<PalSocket>>) {
        let _ = result;
    }

    /// Close sequence finished; every in-flight operation has resolved.
    fn closed(&self);
}
