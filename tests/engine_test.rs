//! End-to-end engine scenarios over the in-process transport.
//!
//! The peer end of the transport plays the remote client: it speaks the
//! wire protocol against a full engine with real platform sockets on
//! loopback.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use proxyd::config::parse_range_list;
use proxyd::err::Error;
use proxyd::io::message::{Message, MessageKind, Payload, LINK_VERSION};
use proxyd::io::reference::Reference;
use proxyd::ns::NsEntry;
use proxyd::pal::net::{flags, Family, Protocol, SocketAddress, SocketKind};
use proxyd::pal::SocketProps;
use proxyd::transport::inproc::{InprocPeer, InprocTransport};
use proxyd::transport::Transport;
use proxyd::{CodecId, ProxyServer, Scheduler};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    server: Arc<ProxyServer>,
    peer: InprocPeer,
    client_ref: Reference,
    stream_ref: Reference,
    next_correlation: u64,
    _scheduler: Arc<Scheduler>,
}

impl Client {
    async fn start(restricted_ports: &str) -> Client {
        Client::start_with_streams(restricted_ports).await.0
    }

    /// Like `start`, but also returns the acceptor for private stream
    /// connections the engine dials out (non-polled opens).
    async fn start_with_streams(
        restricted_ports: &str,
    ) -> (Client, mpsc::UnboundedReceiver<(NsEntry, InprocPeer)>) {
        let scheduler = Scheduler::new();
        let (transport, mut accepts) = InprocTransport::new();
        let (stream_transport, stream_accepts) = InprocTransport::new();
        let stream_transport: Arc<dyn Transport> = stream_transport;
        let cs = "HostName=bus.local;DeviceId=proxy;SharedAccessKey=a2V5"
            .parse()
            .unwrap();
        let entry = NsEntry::new_proxy("test-proxy", &cs);
        let server = ProxyServer::create(
            transport.clone(),
            Some(stream_transport),
            &entry,
            &scheduler,
            parse_range_list(restricted_ports).unwrap(),
            false,
        )
        .unwrap();
        let (_entry, peer) = accepts.recv().await.unwrap();
        let client = Client {
            server,
            peer,
            client_ref: Reference::random(),
            stream_ref: Reference::random(),
            next_correlation: 1,
            _scheduler: scheduler,
        };
        (client, stream_accepts)
    }

    fn send(&mut self, target: Reference, payload: Payload) -> u64 {
        let correlation = self.next_correlation;
        self.next_correlation += 1;
        let mut message = Message::new(self.client_ref, target, payload);
        message.correlation_id = correlation;
        self.peer.tx.send(message).unwrap();
        correlation
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.peer.rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
    }

    /// Receive until a message matching `pred` arrives; unrelated traffic
    /// (keepalive acks and the like) is skipped.
    async fn recv_matching(&mut self, pred: impl Fn(&Message) -> bool) -> Message {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    fn tcp_props(addr: std::net::SocketAddr, extra_flags: u32) -> SocketProps {
        SocketProps {
            family: Family::Inet,
            kind: SocketKind::Stream,
            protocol: Protocol::Tcp,
            flags: extra_flags,
            address: SocketAddress::from_std(addr),
            timeout: 30_000,
        }
    }

    async fn link(&mut self, props: SocketProps) -> Message {
        self.send(
            Reference::NULL,
            Payload::LinkRequest {
                version: LINK_VERSION,
                props,
            },
        );
        self.recv_matching(|m| m.kind() == MessageKind::Link && m.is_response)
            .await
    }

    async fn open_polled(&mut self, link_id: Reference) -> Message {
        let stream_ref = self.stream_ref;
        self.send(
            link_id,
            Payload::OpenRequest {
                stream_id: stream_ref,
                polled: true,
                connection_string: String::new(),
                encoding: CodecId::Auto.as_u32(),
                cs_type: 0,
                max_recv: 1024,
            },
        );
        self.recv_matching(|m| m.kind() == MessageKind::Open && m.is_response)
            .await
    }

    /// Open with a private non-polled stream; the engine dials the stream
    /// connection out through the stream transport.
    async fn open_streaming(&mut self, link_id: Reference) -> Message {
        let stream_ref = self.stream_ref;
        self.send(
            link_id,
            Payload::OpenRequest {
                stream_id: stream_ref,
                polled: false,
                connection_string: "HostName=streams.local;DeviceId=s;SharedAccessKey=a2V5"
                    .into(),
                encoding: CodecId::Json.as_u32(),
                cs_type: 0,
                max_recv: 1024,
            },
        );
        self.recv_matching(|m| m.kind() == MessageKind::Open && m.is_response)
            .await
    }
}

/// Echo server on loopback; replies with whatever it reads.
async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restricted_port_refuses_link() {
    let mut client = Client::start("80-80;443-443").await;
    let response = client
        .link(Client::tcp_props("192.0.2.1:80".parse().unwrap(), 0))
        .await;
    assert_eq!(response.error_code, Error::Refused.code());
    assert_eq!(client.server.socket_count(), 0);
}

#[tokio::test]
async fn test_unrestricted_port_is_not_refused() {
    let mut client = Client::start("80-80").await;
    let echo = spawn_echo().await;
    let response = client.link(Client::tcp_props(echo, 0)).await;
    assert_eq!(response.error_code, 0);
}

#[tokio::test]
async fn test_polled_open_echo_close() {
    let mut client = Client::start("").await;
    let echo = spawn_echo().await;

    // Link.
    let link_response = client.link(Client::tcp_props(echo, 0)).await;
    assert_eq!(link_response.error_code, 0);
    let Payload::LinkResponse { link_id, local_address, .. } = &link_response.payload else {
        panic!("not a link response: {link_response:?}");
    };
    let link_id = *link_id;
    assert!(!link_id.is_null());
    assert_ne!(*local_address, SocketAddress::Unspec);

    // Open in polled mode over the shared listener.
    let open_response = client.open_polled(link_id).await;
    assert_eq!(open_response.error_code, 0);

    // Send data, then poll for the echo.
    client.send(
        link_id,
        Payload::Data {
            sequence_number: 1,
            source_address: SocketAddress::Unspec,
            buffer: bytes::Bytes::from_static(b"hello"),
        },
    );
    client.send(
        link_id,
        Payload::PollRequest {
            sequence_number: 2,
            timeout: 5000,
        },
    );

    // The echo must come back as a data message from the socket.
    let echoed = client
        .recv_matching(|m| {
            matches!(&m.payload, Payload::Data { buffer, .. } if buffer.as_ref() == b"hello")
        })
        .await;
    assert_eq!(echoed.source, link_id);
    assert_eq!(echoed.target, client.stream_ref);

    // Close; the counters reflect the five bytes each way.
    client.send(link_id, Payload::CloseRequest);
    let close_response = client
        .recv_matching(|m| m.kind() == MessageKind::Close && m.is_response)
        .await;
    let Payload::CloseResponse {
        bytes_sent,
        bytes_received,
        error_code,
        ..
    } = close_response.payload
    else {
        panic!("not a close response");
    };
    assert_eq!(error_code, 0);
    assert_eq!(bytes_sent, 5);
    assert_eq!(bytes_received, 5);
}

#[tokio::test]
async fn test_piggyback_uses_poll_correlation_id() {
    let mut client = Client::start("").await;

    // A server that pushes 64 bytes as soon as the connection opens; the
    // client never sends, so no send-ack can race the parked poll.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&[0xAB; 64]).await.unwrap();
        // Hold the connection open.
        let mut buf = [0u8; 16];
        let _ = stream.read(&mut buf).await;
    });

    let link_response = client.link(Client::tcp_props(addr, 0)).await;
    let Payload::LinkResponse { link_id, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let link_id = *link_id;
    let open_response = client.open_polled(link_id).await;
    assert_eq!(open_response.error_code, 0);

    let poll_correlation = client.send(
        link_id,
        Payload::PollRequest {
            sequence_number: 1,
            timeout: 5000,
        },
    );

    // The next message for this socket must be a single data message that
    // borrowed the poll's correlation id — not a bare poll response.
    let first = client
        .recv_matching(|m| m.source == link_id || m.correlation_id == poll_correlation)
        .await;
    assert_eq!(first.kind(), MessageKind::Data);
    assert_eq!(first.correlation_id, poll_correlation);
    let Payload::Data { buffer, .. } = &first.payload else {
        panic!("expected data");
    };
    assert_eq!(buffer.len(), 64);
    assert!(buffer.iter().all(|b| *b == 0xAB));
}

#[tokio::test]
async fn test_accept_loop_produces_distinct_link_requests() {
    let mut client = Client::start("").await;

    // Passive link on an ephemeral port.
    let link_response = client
        .link(Client::tcp_props(
            "127.0.0.1:0".parse().unwrap(),
            flags::PASSIVE,
        ))
        .await;
    assert_eq!(link_response.error_code, 0);
    let Payload::LinkResponse { link_id, local_address, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let link_id = *link_id;
    let port = local_address.port().expect("listener has a port");

    let open_response = client.open_polled(link_id).await;
    assert_eq!(open_response.error_code, 0);

    // Three inbound connections; fetch each accept notification by poll.
    let mut seen = Vec::new();
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(
            tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap(),
        );
        client.send(
            link_id,
            Payload::PollRequest {
                sequence_number: 0,
                timeout: 5000,
            },
        );
        let notification = client
            .recv_matching(|m| m.kind() == MessageKind::Link && !m.is_response)
            .await;
        let Payload::LinkRequest { version, props } = &notification.payload else {
            panic!("expected link request");
        };
        assert_eq!(*version, LINK_VERSION);
        assert_eq!(props.family, Family::Inet);
        seen.push(notification.source);
    }
    assert_eq!(seen.len(), 3);
    let distinct: std::collections::HashSet<_> = seen.iter().collect();
    assert_eq!(distinct.len(), 3, "link ids must be distinct");

    // Closing the passive socket cancels the outstanding accept without
    // producing further link messages.
    client.send(link_id, Payload::CloseRequest);
    client
        .recv_matching(|m| m.kind() == MessageKind::Close && m.is_response)
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(extra) = client.peer.rx.try_recv() {
        assert_ne!(extra.kind(), MessageKind::Link, "no link after close");
    }
}

#[tokio::test]
async fn test_unsupported_encoding_rejects_open() {
    let mut client = Client::start("").await;
    let echo = spawn_echo().await;

    let link_response = client.link(Client::tcp_props(echo, 0)).await;
    let Payload::LinkResponse { link_id, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let link_id = *link_id;

    let stream_ref = client.stream_ref;
    client.send(
        link_id,
        Payload::OpenRequest {
            stream_id: stream_ref,
            polled: true,
            connection_string: "HostName=elsewhere;SharedAccessKey=eA==".into(),
            encoding: 3, // unsupported
            cs_type: 0,
            max_recv: 0,
        },
    );
    let response = client
        .recv_matching(|m| m.kind() == MessageKind::Open && m.is_response)
        .await;
    assert_eq!(response.error_code, Error::NotSupported.code());

    // The socket stayed in created: a well-formed open still succeeds.
    let open_response = client.open_polled(link_id).await;
    assert_eq!(open_response.error_code, 0);
}

#[tokio::test]
async fn test_private_stream_close_handshake() {
    let (mut client, mut streams) = Client::start_with_streams("").await;
    let echo = spawn_echo().await;

    let link_response = client.link(Client::tcp_props(echo, 0)).await;
    assert_eq!(link_response.error_code, 0);
    let Payload::LinkResponse { link_id, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let link_id = *link_id;

    // Non-polled open with a connection string: the engine dials out a
    // private stream connection; take its far end.
    let open_response = client.open_streaming(link_id).await;
    assert_eq!(open_response.error_code, 0);
    let (entry, mut stream) = tokio::time::timeout(RECV_TIMEOUT, streams.recv())
        .await
        .expect("engine did not dial a stream")
        .expect("stream transport gone");
    assert_eq!(entry.addr(), client.stream_ref);

    // Payload rides the private stream both ways, no acks in between.
    let mut data = Message::new(
        client.stream_ref,
        link_id,
        Payload::Data {
            sequence_number: 1,
            source_address: SocketAddress::Unspec,
            buffer: bytes::Bytes::from_static(b"hello"),
        },
    );
    data.correlation_id = 11;
    stream.tx.send(data).unwrap();

    let echoed = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let message = stream.rx.recv().await.expect("stream ended");
            if matches!(&message.payload, Payload::Data { buffer, .. } if buffer.as_ref() == b"hello")
            {
                return message;
            }
        }
    })
    .await
    .expect("no echo on the private stream");
    assert_eq!(echoed.source, link_id);
    assert_eq!(echoed.target, client.stream_ref);

    // Close over the stream, then a late data message and a late poll.
    stream
        .tx
        .send(Message::new(client.stream_ref, link_id, Payload::CloseRequest))
        .unwrap();
    stream
        .tx
        .send(Message::new(
            client.stream_ref,
            link_id,
            Payload::Data {
                sequence_number: 2,
                source_address: SocketAddress::Unspec,
                buffer: bytes::Bytes::from_static(b"late"),
            },
        ))
        .unwrap();
    stream
        .tx
        .send(Message::new(
            client.stream_ref,
            link_id,
            Payload::PollRequest {
                sequence_number: 3,
                timeout: 1000,
            },
        ))
        .unwrap();

    // The close handshake answers on the stream itself, counters included.
    let close_response = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let message = stream.rx.recv().await.expect("stream ended");
            if message.kind() == MessageKind::Close && message.is_response {
                return message;
            }
        }
    })
    .await
    .expect("no close response on the private stream");
    let Payload::CloseResponse {
        bytes_sent,
        bytes_received,
        error_code,
        ..
    } = close_response.payload
    else {
        panic!("not a close response");
    };
    assert_eq!(error_code, 0);
    assert_eq!(bytes_sent, 5);
    assert_eq!(bytes_received, 5);

    // Both late messages are answered with `closed`, not swallowed.
    let mut late_kinds = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let message = stream.rx.recv().await.expect("stream ended");
                if message.is_response {
                    return message;
                }
            }
        })
        .await
        .expect("post-close error response not delivered");
        assert_eq!(message.error_code, Error::Closed.code());
        late_kinds.push(message.kind());
    }
    assert!(late_kinds.contains(&MessageKind::Data));
    assert!(late_kinds.contains(&MessageKind::Poll));
}

#[tokio::test]
async fn test_internal_browse_link_serves_port_scan() {
    use proxyd::browse::{request_kind, BrowseRequest, BrowseResponse, BROWSE_PORT};

    let mut client = Client::start("").await;
    let echo = spawn_echo().await;

    // Internal link: empty host, the browse port, codec id in the flags.
    let props = SocketProps {
        family: Family::Proxy,
        kind: SocketKind::Stream,
        protocol: Protocol::Unspec,
        flags: flags::INTERNAL,
        address: SocketAddress::Proxy {
            host: String::new(),
            port: BROWSE_PORT,
            flags: CodecId::Json.as_u32(),
        },
        timeout: 30_000,
    };
    let link_response = client.link(props).await;
    assert_eq!(link_response.error_code, 0);
    let Payload::LinkResponse { link_id, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let link_id = *link_id;

    let open_response = client.open_polled(link_id).await;
    assert_eq!(open_response.error_code, 0);

    // One browse request: scan the echo port on loopback.
    let request = BrowseRequest {
        handle: 7,
        kind: request_kind::PORTS,
        item: format!("127.0.0.1:{}-{}", echo.port(), echo.port()),
        flags: proxyd::scan::flags::NO_NAME_LOOKUP,
    };
    let body = serde_json::to_vec(&request).unwrap();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    client.send(
        link_id,
        Payload::Data {
            sequence_number: 1,
            source_address: SocketAddress::Unspec,
            buffer: bytes::Bytes::from(frame),
        },
    );

    // Poll for responses, reassembling frames, until the stream reports
    // exhaustion.
    let mut wire = Vec::new();
    let mut responses: Vec<BrowseResponse> = Vec::new();
    'outer: for _ in 0..10 {
        client.send(
            link_id,
            Payload::PollRequest {
                sequence_number: 0,
                timeout: 3000,
            },
        );
        let message = client
            .recv_matching(|m| matches!(&m.payload, Payload::Data { buffer, .. } if !buffer.is_empty()))
            .await;
        let Payload::Data { buffer, .. } = &message.payload else {
            unreachable!();
        };
        wire.extend_from_slice(buffer);
        while wire.len() >= 4 {
            let len = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
            if wire.len() < 4 + len {
                break;
            }
            let response: BrowseResponse = serde_json::from_slice(&wire[4..4 + len]).unwrap();
            wire.drain(..4 + len);
            let done = response.error_code == Error::Nomore.code();
            responses.push(response);
            if done {
                break 'outer;
            }
        }
    }

    let hit = responses
        .iter()
        .find(|r| r.address.is_some())
        .expect("no scan hit reported");
    assert_eq!(hit.handle, 7);
    assert_eq!(
        hit.address,
        Some(SocketAddress::Inet {
            addr: [127, 0, 0, 1],
            port: echo.port(),
        })
    );
    assert_eq!(
        responses.last().unwrap().error_code,
        Error::Nomore.code(),
        "exhaustion must be reported"
    );
}

#[tokio::test]
async fn test_message_for_unknown_socket_answered_closed() {
    let mut client = Client::start("").await;
    client.send(Reference::random(), Payload::CloseRequest);
    let response = client.recv().await;
    assert_eq!(response.error_code, Error::Closed.code());
}

#[tokio::test]
async fn test_ping_resolves_loopback() {
    let mut client = Client::start("").await;
    client.send(
        Reference::NULL,
        Payload::PingRequest {
            address: SocketAddress::Proxy {
                host: "localhost".into(),
                port: 7,
                flags: 0,
            },
        },
    );
    let response = client
        .recv_matching(|m| m.kind() == MessageKind::Ping && m.is_response)
        .await;
    assert_eq!(response.error_code, 0);
    let Payload::PingResponse { address } = &response.payload else {
        panic!("not a ping response");
    };
    assert_eq!(address.port(), Some(7));
}

#[tokio::test]
async fn test_ping_restricted_port_refused() {
    let mut client = Client::start("7-7").await;
    client.send(
        Reference::NULL,
        Payload::PingRequest {
            address: SocketAddress::Proxy {
                host: "localhost".into(),
                port: 7,
                flags: 0,
            },
        },
    );
    let response = client
        .recv_matching(|m| m.kind() == MessageKind::Ping && m.is_response)
        .await;
    assert_eq!(response.error_code, Error::Refused.code());
}

#[tokio::test]
async fn test_idle_socket_is_collected() {
    let mut client = Client::start("").await;
    let echo = spawn_echo().await;

    let link_response = client.link(Client::tcp_props(echo, 0)).await;
    let Payload::LinkResponse { link_id, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let link_id = *link_id;
    let open_response = client.open_polled(link_id).await;
    assert_eq!(open_response.error_code, 0);

    // Park a long poll so the close notification has a return path, then
    // drop the inactivity timeout and go quiet.
    client.send(
        link_id,
        Payload::PollRequest {
            sequence_number: 1,
            timeout: 120_000,
        },
    );
    client.send(
        link_id,
        Payload::SetOptRequest {
            so_val: proxyd::pal::SockOptValue {
                opt: proxyd::pal::SockOpt::PropsTimeout,
                value: 100,
                mcast: None,
            },
        },
    );
    client
        .recv_matching(|m| m.kind() == MessageKind::SetOpt && m.is_response)
        .await;

    // Within one worker interval the socket times out, pushes a local
    // close toward the stream, and is then collected and destroyed.
    let rx = &mut client.peer.rx;
    let notification = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let message = rx.recv().await.expect("stream ended");
            if message.kind() == MessageKind::Close && !message.is_response {
                return message;
            }
        }
    })
    .await
    .expect("no close notification from idle gc");
    assert_eq!(notification.source, link_id);

    tokio::time::timeout(Duration::from_secs(15), async {
        while client.server.socket_count() != 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("idle socket was not destroyed");
}

#[tokio::test]
async fn test_shutdown_drains_sockets() {
    let mut client = Client::start("").await;
    let echo = spawn_echo().await;

    let link_response = client.link(Client::tcp_props(echo, 0)).await;
    let Payload::LinkResponse { link_id, .. } = &link_response.payload else {
        panic!("not a link response");
    };
    let open_response = client.open_polled(*link_id).await;
    assert_eq!(open_response.error_code, 0);
    assert_eq!(client.server.socket_count(), 1);

    client.server.shutdown();
    tokio::time::timeout(Duration::from_secs(10), client.server.join())
        .await
        .expect("engine did not drain");
    assert_eq!(client.server.socket_count(), 0);
}
