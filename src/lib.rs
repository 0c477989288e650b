pub mod browse;
pub mod config;
pub mod err;
pub mod io;
pub mod ns;
pub mod pal;
pub mod scan;
pub mod sched;
pub mod sd;
pub mod server;
pub mod transport;

pub use config::ProxyConfig;
pub use err::{Error, Result};
pub use io::{CodecId, Message, MessageKind, Payload, Reference};
pub use ns::{NsEntry, NsRegistry};
pub use sched::Scheduler;
pub use server::ProxyServer;
