// SPDX-License-Identifier: MIT
//! Typed message envelope.
//!
//! Every unit the bus carries is a [`Message`]: correlation id, source /
//! target / proxy references, an error code, and a payload discriminated by
//! [`MessageKind`]. Payload buffers are [`Bytes`] handles — enqueueing never
//! copies them. Messages minted by a pooled factory carry a lease that
//! returns their slot on drop (see [`crate::io::pool`]).

use bytes::Bytes;

use crate::err::{Error, ER_OK};
use crate::io::pool::PoolLease;
use crate::io::reference::Reference;
use crate::pal::net::SocketAddress;
use crate::pal::{SockOpt, SockOptValue, SocketProps};

/// Envelope wire version.
pub const WIRE_VERSION: u32 = 1;

/// Link payload version, compared monotonically by clients.
pub const LINK_VERSION: u32 = 8;

// ─── Kinds ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Link,
    Open,
    SetOpt,
    GetOpt,
    Close,
    Poll,
    Data,
}

impl MessageKind {
    pub fn as_u32(self) -> u32 {
        match self {
            MessageKind::Ping => 10,
            MessageKind::Link => 12,
            MessageKind::Open => 14,
            MessageKind::SetOpt => 16,
            MessageKind::GetOpt => 18,
            MessageKind::Close => 20,
            MessageKind::Poll => 22,
            MessageKind::Data => 24,
        }
    }

    pub fn from_u32(v: u32) -> Option<MessageKind> {
        Some(match v {
            10 => MessageKind::Ping,
            12 => MessageKind::Link,
            14 => MessageKind::Open,
            16 => MessageKind::SetOpt,
            18 => MessageKind::GetOpt,
            20 => MessageKind::Close,
            22 => MessageKind::Poll,
            24 => MessageKind::Data,
            _ => return None,
        })
    }
}

// ─── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PingRequest {
        address: SocketAddress,
    },
    PingResponse {
        address: SocketAddress,
    },
    LinkRequest {
        version: u32,
        props: SocketProps,
    },
    LinkResponse {
        version: u32,
        link_id: Reference,
        local_address: SocketAddress,
        peer_address: SocketAddress,
    },
    OpenRequest {
        stream_id: Reference,
        polled: bool,
        connection_string: String,
        encoding: u32,
        cs_type: u32,
        max_recv: u64,
    },
    OpenResponse,
    CloseRequest,
    CloseResponse {
        time_open: u64,
        bytes_sent: u64,
        bytes_received: u64,
        error_code: i32,
    },
    SetOptRequest {
        so_val: SockOptValue,
    },
    SetOptResponse,
    GetOptRequest {
        so_opt: SockOpt,
    },
    GetOptResponse {
        so_val: SockOptValue,
    },
    PollRequest {
        sequence_number: u64,
        timeout: u64,
    },
    PollResponse {
        sequence_number: u64,
        timeout: u64,
    },
    Data {
        sequence_number: u64,
        source_address: SocketAddress,
        buffer: Bytes,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::PingRequest { .. } | Payload::PingResponse { .. } => MessageKind::Ping,
            Payload::LinkRequest { .. } | Payload::LinkResponse { .. } => MessageKind::Link,
            Payload::OpenRequest { .. } | Payload::OpenResponse => MessageKind::Open,
            Payload::SetOptRequest { .. } | Payload::SetOptResponse => MessageKind::SetOpt,
            Payload::GetOptRequest { .. } | Payload::GetOptResponse { .. } => MessageKind::GetOpt,
            Payload::CloseRequest | Payload::CloseResponse { .. } => MessageKind::Close,
            Payload::PollRequest { .. } | Payload::PollResponse { .. } => MessageKind::Poll,
            Payload::Data { .. } => MessageKind::Data,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Payload::PingResponse { .. }
                | Payload::LinkResponse { .. }
                | Payload::OpenResponse
                | Payload::CloseResponse { .. }
                | Payload::SetOptResponse
                | Payload::GetOptResponse { .. }
                | Payload::PollResponse { .. }
        )
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Message {
    pub version: u32,
    pub source: Reference,
    pub proxy: Reference,
    pub target: Reference,
    pub correlation_id: u64,
    /// Response direction flag; carried on the wire alongside the kind so
    /// errored data/poll messages can be echoed back as responses.
    pub is_response: bool,
    pub error_code: i32,
    pub payload: Payload,
    /// Pool slot held while this message (or any clone) is alive.
    pub(crate) lease: Option<PoolLease>,
}

impl Message {
    pub fn new(source: Reference, target: Reference, payload: Payload) -> Message {
        Message {
            version: WIRE_VERSION,
            source,
            proxy: Reference::NULL,
            target,
            correlation_id: 0,
            is_response: false,
            error_code: ER_OK,
            payload,
            lease: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Echo a request as a response: direction flag set, source and target
    /// swapped, payload untouched.
    pub fn as_response(&self) -> Message {
        let mut response = self.clone();
        response.is_response = true;
        std::mem::swap(&mut response.source, &mut response.target);
        response
    }

    /// Turn a request into its response: source and target swap, the
    /// payload is replaced by the caller's response payload.
    pub fn into_response(mut self, payload: Payload) -> Message {
        std::mem::swap(&mut self.source, &mut self.target);
        self.is_response = true;
        self.payload = payload;
        self
    }

    pub fn set_error(&mut self, err: Option<Error>) {
        self.error_code = Error::code_of(err);
    }

    pub fn error(&self) -> Option<Error> {
        if self.error_code == ER_OK {
            None
        } else {
            Some(Error::from_code(self.error_code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_numbering_round_trips() {
        for kind in [
            MessageKind::Ping,
            MessageKind::Link,
            MessageKind::Open,
            MessageKind::SetOpt,
            MessageKind::GetOpt,
            MessageKind::Close,
            MessageKind::Poll,
            MessageKind::Data,
        ] {
            assert_eq!(MessageKind::from_u32(kind.as_u32()), Some(kind));
        }
        assert_eq!(MessageKind::from_u32(999), None);
    }

    #[test]
    fn test_into_response_swaps_refs() {
        let a = Reference::random();
        let b = Reference::random();
        let req = Message::new(a, b, Payload::CloseRequest);
        let resp = req.into_response(Payload::CloseResponse {
            time_open: 1,
            bytes_sent: 2,
            bytes_received: 3,
            error_code: ER_OK,
        });
        assert_eq!(resp.source, b);
        assert_eq!(resp.target, a);
        assert!(resp.payload.is_response());
    }
}
