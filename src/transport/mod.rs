//! Message transports.
//!
//! A [`Transport`] binds a name-service entry to a [`Connection`]: a
//! message-oriented bidirectional channel that delivers inbound messages
//! through an event callback (always invoked on the owning scheduler) and
//! accepts outbound sends. `send` is a synchronous handoff — a transmit
//! failure surfaces through the next `Reconnecting`/`Closed` event, not the
//! send call.

pub mod inproc;
pub mod ws;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::err::{Error, Result};
use crate::io::codec::{self, CodecId};
use crate::io::message::Message;
use crate::ns::NsEntry;
use crate::sched::SchedulerHandle;

/// Events a connection delivers to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    Received(Message),
    /// The transport lost its link and is reconnecting automatically.
    Reconnecting(Error),
    Closed,
}

/// Callback invoked on the connection's scheduler for every event.
pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Named transport binding producing connections.
pub trait Transport: Send + Sync {
    /// Instantiate a connection to the endpoint described by `entry` and
    /// start receiving. Connection establishment continues in the
    /// background; early sends are queued.
    fn create(
        &self,
        entry: &NsEntry,
        codec: CodecId,
        handler: EventHandler,
        sched: Arc<SchedulerHandle>,
    ) -> Result<Arc<Connection>>;
}

/// A live message channel.
pub struct Connection {
    codec: CodecId,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(
        codec: CodecId,
        out_tx: mpsc::UnboundedSender<Vec<u8>>,
        close_tx: watch::Sender<bool>,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            codec,
            out_tx,
            close_tx,
        })
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    /// Encode and enqueue for transmission. Returns once the message is
    /// handed off; [`Error::Closed`] if the connection is gone.
    pub fn send(&self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message, self.codec)?;
        self.out_tx.send(bytes).map_err(|_| Error::Closed)
    }

    /// Begin asynchronous close; a `Closed` event follows.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("codec", &self.codec)
            .finish()
    }
}
