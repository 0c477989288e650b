//! In-process transport.
//!
//! Connects a [`Connection`] to a same-process peer over channels, pushing
//! every message through the selected codec so the wire shape is exercised
//! end to end. Integration tests use it as the control listener; the peer
//! side plays the remote client.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::err::{Error, Result};
use crate::io::codec::{self, CodecId};
use crate::io::message::Message;
use crate::ns::NsEntry;
use crate::sched::SchedulerHandle;
use crate::transport::{Connection, ConnectionEvent, EventHandler, Transport};

/// The far end of an in-process connection.
pub struct InprocPeer {
    /// Messages the peer sends toward the connection owner.
    pub tx: mpsc::UnboundedSender<Message>,
    /// Messages the connection owner sent.
    pub rx: mpsc::UnboundedReceiver<Message>,
}

/// Create a connection and its peer end.
pub fn pair(
    codec: CodecId,
    handler: EventHandler,
    sched: Arc<SchedulerHandle>,
) -> (Arc<Connection>, InprocPeer) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, mut close_rx) = watch::channel(false);
    let (peer_in_tx, mut peer_in_rx) = mpsc::unbounded_channel::<Message>();
    let (peer_out_tx, peer_out_rx) = mpsc::unbounded_channel::<Message>();

    let conn = Connection::new(codec, out_tx, close_tx);

    tokio::spawn(async move {
        let deliver = |ev: ConnectionEvent| {
            let handler = handler.clone();
            sched.queue("conn_event", move || handler(ev));
        };
        loop {
            tokio::select! {
                biased;

                _ = close_rx.changed() => break,

                inbound = peer_in_rx.recv() => {
                    let Some(message) = inbound else {
                        deliver(ConnectionEvent::Reconnecting(Error::Closed));
                        break;
                    };
                    // Round-trip through the codec, like a real wire.
                    match codec::encode(&message, codec)
                        .and_then(|bytes| codec::decode(&bytes, codec))
                    {
                        Ok(decoded) => deliver(ConnectionEvent::Received(decoded)),
                        Err(e) => warn!(err = %e, "inproc: frame dropped"),
                    }
                }

                outbound = out_rx.recv() => {
                    let Some(bytes) = outbound else { break };
                    match codec::decode(&bytes, codec) {
                        Ok(message) => {
                            if peer_out_tx.send(message).is_err() {
                                deliver(ConnectionEvent::Reconnecting(Error::Closed));
                                break;
                            }
                        }
                        Err(e) => warn!(err = %e, "inproc: bad outbound frame"),
                    }
                }
            }
        }
        deliver(ConnectionEvent::Closed);
    });

    (
        conn,
        InprocPeer {
            tx: peer_in_tx,
            rx: peer_out_rx,
        },
    )
}

/// Transport producing in-process connections; every `create` hands the
/// server end to the receiver returned by [`InprocTransport::new`].
pub struct InprocTransport {
    accepts: mpsc::UnboundedSender<(NsEntry, InprocPeer)>,
}

impl InprocTransport {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (
        Arc<InprocTransport>,
        mpsc::UnboundedReceiver<(NsEntry, InprocPeer)>,
    ) {
        let (accepts, accept_rx) = mpsc::unbounded_channel();
        (Arc::new(InprocTransport { accepts }), accept_rx)
    }
}

impl Transport for InprocTransport {
    fn create(
        &self,
        entry: &NsEntry,
        codec: CodecId,
        handler: EventHandler,
        sched: Arc<SchedulerHandle>,
    ) -> Result<Arc<Connection>> {
        let (conn, peer) = pair(codec, handler, sched);
        self.accepts
            .send((entry.clone(), peer))
            .map_err(|_| Error::Closed)?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::message::Payload;
    use crate::io::reference::Reference;
    use crate::sched::Scheduler;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_both_directions_cross_the_codec() {
        let sched = Scheduler::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler: EventHandler = Arc::new(move |ev| {
            if let ConnectionEvent::Received(m) = ev {
                sink.lock().unwrap().push(m);
            }
        });
        let (conn, mut peer) = pair(CodecId::MsgPack, handler, sched.handle());

        let message = Message::new(Reference::random(), Reference::NULL, Payload::CloseRequest);
        conn.send(&message).unwrap();
        let out = peer.rx.recv().await.unwrap();
        assert_eq!(out.payload, Payload::CloseRequest);

        peer.tx.send(message).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
        conn.close();
    }
}
