//! Round-trip laws: encode∘decode is identity on every payload, on both
//! codecs; references survive their string and socket-address projections.

use bytes::Bytes;
use proptest::prelude::*;

use proxyd::io::codec::{decode, encode, CodecId};
use proxyd::io::message::{Message, Payload};
use proxyd::io::reference::Reference;
use proxyd::pal::net::{Protocol, SocketAddress, SocketKind};
use proxyd::pal::{SockOpt, SockOptValue, SocketProps};

fn arb_reference() -> impl Strategy<Value = Reference> {
    any::<[u8; 16]>().prop_map(Reference::from_bytes)
}

fn arb_address() -> impl Strategy<Value = SocketAddress> {
    prop_oneof![
        Just(SocketAddress::Unspec),
        (any::<[u8; 4]>(), any::<u16>()).prop_map(|(addr, port)| SocketAddress::Inet {
            addr,
            port
        }),
        (any::<[u8; 16]>(), any::<u16>(), any::<u32>(), any::<u32>()).prop_map(
            |(addr, port, flow, scope)| SocketAddress::Inet6 {
                addr,
                port,
                flow,
                scope
            }
        ),
        "[a-z0-9./-]{1,32}".prop_map(|path| SocketAddress::Unix { path }),
        ("[a-z0-9.-]{1,40}", any::<u16>(), any::<u32>()).prop_map(|(host, port, flags)| {
            SocketAddress::Proxy { host, port, flags }
        }),
    ]
}

fn arb_props() -> impl Strategy<Value = SocketProps> {
    (arb_address(), any::<u32>(), any::<u64>()).prop_map(|(address, flags, timeout)| SocketProps {
        family: address.family(),
        kind: SocketKind::Stream,
        protocol: Protocol::Tcp,
        flags,
        address,
        timeout,
    })
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        arb_address().prop_map(|address| Payload::PingRequest { address }),
        arb_address().prop_map(|address| Payload::PingResponse { address }),
        (any::<u32>(), arb_props())
            .prop_map(|(version, props)| Payload::LinkRequest { version, props }),
        (any::<u32>(), arb_reference(), arb_address(), arb_address()).prop_map(
            |(version, link_id, local_address, peer_address)| Payload::LinkResponse {
                version,
                link_id,
                local_address,
                peer_address,
            }
        ),
        (arb_reference(), any::<bool>(), any::<u32>(), any::<u64>()).prop_map(
            |(stream_id, polled, encoding, max_recv)| Payload::OpenRequest {
                stream_id,
                polled,
                connection_string: String::new(),
                encoding: encoding % 4,
                cs_type: 0,
                max_recv,
            }
        ),
        Just(Payload::OpenResponse),
        Just(Payload::CloseRequest),
        (any::<u64>(), any::<u64>(), any::<u64>(), any::<i32>()).prop_map(
            |(time_open, bytes_sent, bytes_received, error_code)| Payload::CloseResponse {
                time_open,
                bytes_sent,
                bytes_received,
                error_code,
            }
        ),
        (any::<u64>()).prop_map(|value| Payload::SetOptRequest {
            so_val: SockOptValue {
                opt: SockOpt::Rcvbuf,
                value,
                mcast: None,
            }
        }),
        Just(Payload::SetOptResponse),
        Just(Payload::GetOptRequest {
            so_opt: SockOpt::PropsTimeout
        }),
        (any::<u64>(), any::<u64>()).prop_map(|(sequence_number, timeout)| Payload::PollRequest {
            sequence_number,
            timeout
        }),
        (any::<u64>(), any::<u64>()).prop_map(|(sequence_number, timeout)| Payload::PollResponse {
            sequence_number,
            timeout
        }),
        (any::<u64>(), arb_address(), proptest::collection::vec(any::<u8>(), 0..512)).prop_map(
            |(sequence_number, source_address, data)| Payload::Data {
                sequence_number,
                source_address,
                buffer: Bytes::from(data),
            }
        ),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        arb_reference(),
        arb_reference(),
        arb_reference(),
        any::<u64>(),
        any::<i32>(),
        arb_payload(),
    )
        .prop_map(|(source, target, proxy, correlation_id, error_code, payload)| {
            let mut message = Message::new(source, target, payload);
            message.proxy = proxy;
            message.correlation_id = correlation_id;
            message.error_code = error_code;
            message
        })
}

fn assert_equivalent(a: &Message, b: &Message) {
    assert_eq!(a.source, b.source);
    assert_eq!(a.target, b.target);
    assert_eq!(a.proxy, b.proxy);
    assert_eq!(a.correlation_id, b.correlation_id);
    assert_eq!(a.error_code, b.error_code);
    assert_eq!(a.payload, b.payload);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_json_round_trip(message in arb_message()) {
        let bytes = encode(&message, CodecId::Json).unwrap();
        let back = decode(&bytes, CodecId::Json).unwrap();
        assert_equivalent(&message, &back);
    }

    #[test]
    fn prop_mpack_round_trip(message in arb_message()) {
        let bytes = encode(&message, CodecId::MsgPack).unwrap();
        let back = decode(&bytes, CodecId::MsgPack).unwrap();
        assert_equivalent(&message, &back);
    }

    #[test]
    fn prop_auto_decodes_either(message in arb_message()) {
        let json = encode(&message, CodecId::Json).unwrap();
        let mpack = encode(&message, CodecId::MsgPack).unwrap();
        assert_equivalent(&message, &decode(&json, CodecId::Auto).unwrap());
        assert_equivalent(&message, &decode(&mpack, CodecId::Auto).unwrap());
    }

    #[test]
    fn prop_reference_string_round_trip(reference in arb_reference()) {
        let text = reference.to_string();
        prop_assert_eq!(text.parse::<Reference>().unwrap(), reference);
    }

    #[test]
    fn prop_reference_socket_address_round_trip(reference in arb_reference()) {
        let sa = reference.to_socket_address();
        prop_assert_eq!(Reference::from_socket_address(&sa), Some(reference));
    }
}
