// SPDX-License-Identifier: MIT
//! WebSocket transport — connects out to the cloud bus so remote clients
//! can reach the proxy without an inbound route.
//!
//! The endpoint URL and credential come from the entry's connection string:
//! an explicit `Endpoint` is used verbatim, otherwise the URL is derived
//! from `HostName` + `DeviceId`. A shared-access token, when present, rides
//! an `Authorization` header. Reconnection is automatic with exponential
//! backoff (2 s doubling to 60 s); each drop is surfaced to the owner as a
//! `Reconnecting` event so it can decide what outstanding work to fail.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as WsFrame},
};
use tracing::{debug, info, warn};

use crate::err::{Error, Result};
use crate::io::codec::{self, CodecId};
use crate::ns::NsEntry;
use crate::sched::SchedulerHandle;
use crate::transport::{Connection, ConnectionEvent, EventHandler, Transport};

/// Client transport over `wss://`.
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Arc<WsTransport> {
        Arc::new(WsTransport)
    }
}

impl Transport for WsTransport {
    fn create(
        &self,
        entry: &NsEntry,
        codec: CodecId,
        handler: EventHandler,
        sched: Arc<SchedulerHandle>,
    ) -> Result<Arc<Connection>> {
        let cs = entry.cs()?;
        let url = match (cs.endpoint(), cs.host_name()) {
            (Some(endpoint), _) => endpoint.to_owned(),
            (None, Some(host)) => {
                let entity = cs.entity().or(cs.device_id()).unwrap_or_default();
                format!("wss://{host}/proxy/{entity}")
            }
            (None, None) => return Err(Error::InvalidFormat),
        };
        let token = cs
            .shared_access_token()
            .or(cs.shared_access_key())
            .map(str::to_owned);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let conn = Connection::new(codec, out_tx, close_tx);

        tokio::spawn(run(url, token, codec, handler, sched, out_rx, close_rx));
        Ok(conn)
    }
}

/// Connect/receive/transmit loop; lives until the owner closes.
async fn run(
    url: String,
    token: Option<String>,
    codec: CodecId,
    handler: EventHandler,
    sched: Arc<SchedulerHandle>,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let deliver = |ev: ConnectionEvent| {
        let handler = handler.clone();
        sched.queue("conn_event", move || handler(ev));
    };
    let mut backoff_secs: u64 = 2;

    'outer: loop {
        if *close_rx.borrow() {
            break;
        }
        info!(url = %url, "transport: connecting");

        let request = match make_request(&url, token.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "transport: bad endpoint");
                deliver(ConnectionEvent::Reconnecting(e));
                break;
            }
        };

        match connect_async(request).await {
            Ok((ws, _)) => {
                info!("transport: connected");
                backoff_secs = 2;
                let (mut sink, mut stream) = ws.split();

                loop {
                    tokio::select! {
                        biased;

                        _ = close_rx.changed() => {
                            let _ = sink.send(WsFrame::Close(None)).await;
                            break 'outer;
                        }

                        frame = stream.next() => {
                            let bytes = match frame {
                                Some(Ok(WsFrame::Text(text))) => text.into_bytes(),
                                Some(Ok(WsFrame::Binary(bin))) => bin,
                                Some(Ok(WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Frame(_))) => continue,
                                Some(Ok(WsFrame::Close(_))) | None => {
                                    deliver(ConnectionEvent::Reconnecting(Error::Closed));
                                    break;
                                }
                                Some(Err(e)) => {
                                    debug!(err = %e, "transport: receive error");
                                    deliver(ConnectionEvent::Reconnecting(Error::Comm));
                                    break;
                                }
                            };
                            match codec::decode(&bytes, codec) {
                                Ok(message) => deliver(ConnectionEvent::Received(message)),
                                Err(e) => warn!(err = %e, "transport: undecodable frame dropped"),
                            }
                        }

                        outbound = out_rx.recv() => {
                            let Some(bytes) = outbound else {
                                // Owner dropped the connection handle.
                                break 'outer;
                            };
                            let frame = match codec {
                                CodecId::MsgPack => WsFrame::Binary(bytes),
                                _ => match String::from_utf8(bytes) {
                                    Ok(text) => WsFrame::Text(text),
                                    Err(e) => WsFrame::Binary(e.into_bytes()),
                                },
                            };
                            if let Err(e) = sink.send(frame).await {
                                debug!(err = %e, "transport: send error");
                                deliver(ConnectionEvent::Reconnecting(Error::Comm));
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(err = %e, "transport: connect failed");
                deliver(ConnectionEvent::Reconnecting(Error::Connecting));
            }
        }

        // Backoff before the next attempt, unless closing.
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = (backoff_secs * 2).min(60);
    }

    deliver(ConnectionEvent::Closed);
}

fn make_request(
    url: &str,
    token: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url
        .into_client_request()
        .map_err(|_| Error::InvalidFormat)?;
    if let Some(token) = token {
        let value = format!("SharedAccessSignature {token}")
            .parse()
            .map_err(|_| Error::InvalidFormat)?;
        request.headers_mut().insert("Authorization", value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::message::{Message, Payload};
    use crate::io::reference::Reference;
    use crate::sched::Scheduler;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn entry_for(port: u16) -> NsEntry {
        let cs: crate::io::cs::ConnectionString =
            format!("Endpoint=ws://127.0.0.1:{port}/;HostName=unused")
                .parse()
                .unwrap();
        NsEntry::new_proxy("test", &cs)
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Echo server; frames bounce back verbatim.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            while let Some(Ok(frame)) = source.next().await {
                if frame.is_text() || frame.is_binary() {
                    sink.send(frame).await.unwrap();
                }
            }
        });

        let sched = Scheduler::new();
        let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let notify = Arc::new(tokio::sync::Notify::new());
        let notify2 = notify.clone();
        let handler: EventHandler = Arc::new(move |ev| {
            if let ConnectionEvent::Received(message) = ev {
                sink.lock().unwrap().push(message);
                notify2.notify_one();
            }
        });

        let transport = WsTransport::new();
        let conn = transport
            .create(&entry_for(port), CodecId::Json, handler, sched.handle())
            .unwrap();

        let ping = Message::new(
            Reference::random(),
            Reference::NULL,
            Payload::PingRequest {
                address: crate::pal::net::SocketAddress::Inet {
                    addr: [127, 0, 0, 1],
                    port: 80,
                },
            },
        );
        conn.send(&ping).unwrap();
        tokio::time::timeout(Duration::from_secs(5), notify.notified())
            .await
            .expect("no echo");
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, ping.payload);
        conn.close();
    }
}
