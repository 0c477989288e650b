//! Wire-level building blocks: references, message envelopes, codecs,
//! pooled message factories, and connection strings.

pub mod codec;
pub mod cs;
pub mod message;
pub mod pool;
pub mod reference;

pub use codec::CodecId;
pub use message::{Message, MessageKind, Payload};
pub use reference::Reference;
