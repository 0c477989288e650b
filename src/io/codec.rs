// SPDX-License-Identifier: MIT
//! Message codecs.
//!
//! JSON is the control-channel default and writes named members; MessagePack
//! is available on streams and writes positionally. Both round-trip the same
//! wire shape: an envelope with a numeric `kind`, a response flag, and a
//! content record whose populated members depend on the kind. Binary payload
//! buffers are base64 strings on JSON and raw byte strings on MessagePack.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::err::{Error, Result};
use crate::io::message::{Message, MessageKind, Payload, WIRE_VERSION};
use crate::io::reference::Reference;
use crate::pal::net::SocketAddress;
use crate::pal::{SockOpt, SockOptValue, SocketProps};

/// Codec selected at connection creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecId {
    /// Accept either on decode; encode as JSON.
    #[default]
    Auto,
    Json,
    MsgPack,
}

impl CodecId {
    /// Wire id carried in open requests.
    pub fn from_u32(v: u32) -> Option<CodecId> {
        Some(match v {
            0 => CodecId::Auto,
            1 => CodecId::Json,
            2 => CodecId::MsgPack,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CodecId::Auto => 0,
            CodecId::Json => 1,
            CodecId::MsgPack => 2,
        }
    }
}

// ─── Wire shape ───────────────────────────────────────────────────────────────

mod buffer_serde {
    use super::*;
    use base64::Engine as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(buf: &Option<Bytes>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match buf {
            None => s.serialize_none(),
            Some(bytes) => {
                if s.is_human_readable() {
                    s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes))
                } else {
                    s.serialize_some(&serde_bytes_wrap(bytes))
                }
            }
        }
    }

    // serde_bytes-style wrapper so MessagePack emits a bin, not an int array.
    fn serde_bytes_wrap(bytes: &Bytes) -> impl Serialize + '_ {
        struct AsBytes<'a>(&'a [u8]);
        impl Serialize for AsBytes<'_> {
            fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_bytes(self.0)
            }
        }
        AsBytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Bytes>, D::Error> {
        use serde::de::Error as _;
        if d.is_human_readable() {
            let text: Option<String> = Option::deserialize(d)?;
            match text {
                None => Ok(None),
                Some(text) => base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map(|v| Some(Bytes::from(v)))
                    .map_err(|_| D::Error::custom("bad base64 buffer")),
            }
        } else {
            let raw: Option<serde_bytes_buf::ByteBuf> = Option::deserialize(d)?;
            Ok(raw.map(|b| Bytes::from(b.0)))
        }
    }

    pub(super) mod serde_bytes_buf {
        use serde::{Deserialize, Deserializer};

        pub struct ByteBuf(pub Vec<u8>);

        impl<'de> Deserialize<'de> for ByteBuf {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                struct V;
                impl<'de> serde::de::Visitor<'de> for V {
                    type Value = ByteBuf;
                    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                        f.write_str("bytes")
                    }
                    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ByteBuf, E> {
                        Ok(ByteBuf(v.to_vec()))
                    }
                    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<ByteBuf, E> {
                        Ok(ByteBuf(v))
                    }
                    fn visit_seq<A: serde::de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<ByteBuf, A::Error> {
                        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                        while let Some(b) = seq.next_element::<u8>()? {
                            out.push(b);
                        }
                        Ok(ByteBuf(out))
                    }
                }
                d.deserialize_byte_buf(V)
            }
        }
    }
}

/// Content record: the union of every payload's members. Members not used by
/// a kind stay `None` (JSON null / MessagePack nil).
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireContent {
    address: Option<SocketAddress>,
    version: Option<u32>,
    props: Option<SocketProps>,
    link_id: Option<Reference>,
    local_address: Option<SocketAddress>,
    peer_address: Option<SocketAddress>,
    stream_id: Option<Reference>,
    polled: Option<bool>,
    connection_string: Option<String>,
    encoding: Option<u32>,
    cs_type: Option<u32>,
    max_recv: Option<u64>,
    time_open: Option<u64>,
    bytes_sent: Option<u64>,
    bytes_received: Option<u64>,
    error_code: Option<i32>,
    so_val: Option<SockOptValue>,
    so_opt: Option<SockOpt>,
    sequence_number: Option<u64>,
    timeout: Option<u64>,
    source_address: Option<SocketAddress>,
    #[serde(with = "buffer_serde")]
    buffer: Option<Bytes>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    version: u32,
    source: Reference,
    proxy: Reference,
    target: Reference,
    correlation_id: u64,
    kind: u32,
    is_response: bool,
    error_code: i32,
    content: WireContent,
}

fn to_wire(message: &Message) -> WireMessage {
    let mut content = WireContent::default();
    let payload = &message.payload;
    match payload.clone() {
        Payload::PingRequest { address } | Payload::PingResponse { address } => {
            content.address = Some(address);
        }
        Payload::LinkRequest { version, props } => {
            content.version = Some(version);
            content.props = Some(props);
        }
        Payload::LinkResponse {
            version,
            link_id,
            local_address,
            peer_address,
        } => {
            content.version = Some(version);
            content.link_id = Some(link_id);
            content.local_address = Some(local_address);
            content.peer_address = Some(peer_address);
        }
        Payload::OpenRequest {
            stream_id,
            polled,
            connection_string,
            encoding,
            cs_type,
            max_recv,
        } => {
            content.stream_id = Some(stream_id);
            content.polled = Some(polled);
            content.connection_string = Some(connection_string);
            content.encoding = Some(encoding);
            content.cs_type = Some(cs_type);
            content.max_recv = Some(max_recv);
        }
        Payload::OpenResponse | Payload::CloseRequest | Payload::SetOptResponse => {}
        Payload::CloseResponse {
            time_open,
            bytes_sent,
            bytes_received,
            error_code,
        } => {
            content.time_open = Some(time_open);
            content.bytes_sent = Some(bytes_sent);
            content.bytes_received = Some(bytes_received);
            content.error_code = Some(error_code);
        }
        Payload::SetOptRequest { so_val } => content.so_val = Some(so_val),
        Payload::GetOptRequest { so_opt } => content.so_opt = Some(so_opt),
        Payload::GetOptResponse { so_val } => content.so_val = Some(so_val),
        Payload::PollRequest {
            sequence_number,
            timeout,
        }
        | Payload::PollResponse {
            sequence_number,
            timeout,
        } => {
            content.sequence_number = Some(sequence_number);
            content.timeout = Some(timeout);
        }
        Payload::Data {
            sequence_number,
            source_address,
            buffer,
        } => {
            content.sequence_number = Some(sequence_number);
            content.source_address = Some(source_address);
            content.buffer = Some(buffer);
        }
    }
    WireMessage {
        version: message.version,
        source: message.source,
        proxy: message.proxy,
        target: message.target,
        correlation_id: message.correlation_id,
        kind: payload.kind().as_u32(),
        is_response: message.is_response || payload.is_response(),
        error_code: message.error_code,
        content,
    }
}

fn from_wire(wire: WireMessage) -> Result<Message> {
    let kind = MessageKind::from_u32(wire.kind).ok_or(Error::InvalidFormat)?;
    let c = wire.content;
    let payload = match (kind, wire.is_response) {
        (MessageKind::Ping, false) => Payload::PingRequest {
            address: c.address.ok_or(Error::InvalidFormat)?,
        },
        (MessageKind::Ping, true) => Payload::PingResponse {
            address: c.address.unwrap_or_default(),
        },
        (MessageKind::Link, false) => Payload::LinkRequest {
            version: c.version.unwrap_or(0),
            props: c.props.ok_or(Error::InvalidFormat)?,
        },
        (MessageKind::Link, true) => Payload::LinkResponse {
            version: c.version.unwrap_or(0),
            link_id: c.link_id.unwrap_or_default(),
            local_address: c.local_address.unwrap_or_default(),
            peer_address: c.peer_address.unwrap_or_default(),
        },
        (MessageKind::Open, false) => Payload::OpenRequest {
            stream_id: c.stream_id.ok_or(Error::InvalidFormat)?,
            polled: c.polled.unwrap_or(false),
            connection_string: c.connection_string.unwrap_or_default(),
            encoding: c.encoding.unwrap_or(0),
            cs_type: c.cs_type.unwrap_or(0),
            max_recv: c.max_recv.unwrap_or(0),
        },
        (MessageKind::Open, true) => Payload::OpenResponse,
        (MessageKind::Close, false) => Payload::CloseRequest,
        (MessageKind::Close, true) => Payload::CloseResponse {
            time_open: c.time_open.unwrap_or(0),
            bytes_sent: c.bytes_sent.unwrap_or(0),
            bytes_received: c.bytes_received.unwrap_or(0),
            error_code: c.error_code.unwrap_or(0),
        },
        (MessageKind::SetOpt, false) => Payload::SetOptRequest {
            so_val: c.so_val.ok_or(Error::InvalidFormat)?,
        },
        (MessageKind::SetOpt, true) => Payload::SetOptResponse,
        (MessageKind::GetOpt, false) => Payload::GetOptRequest {
            so_opt: c.so_opt.ok_or(Error::InvalidFormat)?,
        },
        (MessageKind::GetOpt, true) => Payload::GetOptResponse {
            so_val: c.so_val.ok_or(Error::InvalidFormat)?,
        },
        (MessageKind::Poll, false) => Payload::PollRequest {
            sequence_number: c.sequence_number.unwrap_or(0),
            timeout: c.timeout.unwrap_or(0),
        },
        (MessageKind::Poll, true) => Payload::PollResponse {
            sequence_number: c.sequence_number.unwrap_or(0),
            timeout: c.timeout.unwrap_or(0),
        },
        (MessageKind::Data, _) => Payload::Data {
            sequence_number: c.sequence_number.unwrap_or(0),
            source_address: c.source_address.unwrap_or_default(),
            buffer: c.buffer.unwrap_or_default(),
        },
    };
    Ok(Message {
        version: wire.version,
        source: wire.source,
        proxy: wire.proxy,
        target: wire.target,
        correlation_id: wire.correlation_id,
        is_response: wire.is_response,
        error_code: wire.error_code,
        payload,
        lease: None,
    })
}

// ─── Encode / decode ──────────────────────────────────────────────────────────

pub fn encode(message: &Message, codec: CodecId) -> Result<Vec<u8>> {
    let wire = to_wire(message);
    match codec {
        CodecId::Json | CodecId::Auto => {
            serde_json::to_vec(&wire).map_err(|_| Error::InvalidFormat)
        }
        CodecId::MsgPack => rmp_serde::to_vec(&wire).map_err(|_| Error::InvalidFormat),
    }
}

pub fn decode(bytes: &[u8], codec: CodecId) -> Result<Message> {
    let wire: WireMessage = match codec {
        CodecId::Json => serde_json::from_slice(bytes).map_err(|_| Error::InvalidFormat)?,
        CodecId::MsgPack => rmp_serde::from_slice(bytes).map_err(|_| Error::InvalidFormat)?,
        CodecId::Auto => {
            // Sniff: JSON messages always start with an object brace.
            if bytes.first() == Some(&b'{') {
                serde_json::from_slice(bytes).map_err(|_| Error::InvalidFormat)?
            } else {
                rmp_serde::from_slice(bytes).map_err(|_| Error::InvalidFormat)?
            }
        }
    };
    if wire.version > WIRE_VERSION {
        return Err(Error::NotSupported);
    }
    from_wire(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::net::{Family, Protocol, SocketKind};

    fn sample_messages() -> Vec<Message> {
        let src = Reference::random();
        let dst = Reference::random();
        vec![
            Message::new(
                src,
                dst,
                Payload::PingRequest {
                    address: SocketAddress::Proxy {
                        host: "example.com".into(),
                        port: 443,
                        flags: 0,
                    },
                },
            ),
            Message::new(
                src,
                dst,
                Payload::LinkRequest {
                    version: 8,
                    props: SocketProps {
                        family: Family::Inet,
                        kind: SocketKind::Stream,
                        protocol: Protocol::Tcp,
                        flags: 0,
                        address: SocketAddress::Inet {
                            addr: [192, 0, 2, 1],
                            port: 80,
                        },
                        timeout: 30_000,
                    },
                },
            ),
            Message::new(
                src,
                dst,
                Payload::Data {
                    sequence_number: 7,
                    source_address: SocketAddress::Unspec,
                    buffer: Bytes::from_static(b"\x00\x01binary\xff"),
                },
            ),
            Message::new(
                src,
                dst,
                Payload::PollRequest {
                    sequence_number: 3,
                    timeout: 5000,
                },
            ),
            Message::new(src, dst, Payload::CloseRequest).into_response(
                Payload::CloseResponse {
                    time_open: 12,
                    bytes_sent: 5,
                    bytes_received: 5,
                    error_code: 0,
                },
            ),
            Message::new(
                src,
                dst,
                Payload::SetOptRequest {
                    so_val: SockOptValue {
                        opt: SockOpt::Rcvbuf,
                        value: 65536,
                        mcast: None,
                    },
                },
            ),
        ]
    }

    #[test]
    fn test_json_round_trip() {
        for message in sample_messages() {
            let bytes = encode(&message, CodecId::Json).unwrap();
            let back = decode(&bytes, CodecId::Json).unwrap();
            assert_eq!(back.payload, message.payload);
            assert_eq!(back.source, message.source);
            assert_eq!(back.target, message.target);
        }
    }

    #[test]
    fn test_mpack_round_trip() {
        for message in sample_messages() {
            let bytes = encode(&message, CodecId::MsgPack).unwrap();
            let back = decode(&bytes, CodecId::MsgPack).unwrap();
            assert_eq!(back.payload, message.payload);
            assert_eq!(back.source, message.source);
        }
    }

    #[test]
    fn test_auto_decode_sniffs_both() {
        let message = &sample_messages()[0];
        let json = encode(message, CodecId::Json).unwrap();
        let mpack = encode(message, CodecId::MsgPack).unwrap();
        assert_eq!(decode(&json, CodecId::Auto).unwrap().payload, message.payload);
        assert_eq!(decode(&mpack, CodecId::Auto).unwrap().payload, message.payload);
    }

    #[test]
    fn test_json_buffer_is_base64() {
        let message = &sample_messages()[2];
        let json = encode(message, CodecId::Json).unwrap();
        let text = std::str::from_utf8(&json).unwrap();
        // Raw payload bytes must not appear; the base64 form must.
        assert!(text.contains("AAFiaW5hcnn/"));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut message = sample_messages()[0].clone();
        message.version = WIRE_VERSION + 1;
        let bytes = encode(&message, CodecId::Json).unwrap();
        assert_eq!(decode(&bytes, CodecId::Json).unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode(b"\x95garbage", CodecId::Json).is_err());
        assert!(decode(b"{not json", CodecId::Auto).is_err());
    }
}
