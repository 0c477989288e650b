//! Pooled message factory with flow-control watermarks.
//!
//! A factory admits a bounded number of in-flight messages. Crossing the low
//! watermark (few slots left) fires the callback with `low == true`; rising
//! back past the high watermark fires it with `low == false`. That callback
//! is the receive-side flow control: the owner pauses and resumes the
//! platform socket's read loop with it.
//!
//! Slots are accounting, not storage — payload buffers are allocator-backed
//! [`bytes`] handles reclaimed by refcount, so a slot frees when the last
//! clone of its message drops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::err::{Error, Result};
use crate::io::message::{Message, Payload};
use crate::io::reference::Reference;

/// `(low)` — `true` when the pool just ran low, `false` when it recovered.
pub type FlowControl = Box<dyn Fn(bool) + Send + Sync>;

struct FactoryInner {
    capacity: usize,
    /// Fire `low=true` when free slots drop below this.
    low_watermark: usize,
    /// Fire `low=false` when free slots rise above this.
    high_watermark: usize,
    outstanding: AtomicUsize,
    low: AtomicBool,
    flow: Option<FlowControl>,
}

impl FactoryInner {
    fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.outstanding.load(Ordering::Acquire))
    }

    fn check_watermarks(&self) {
        let Some(flow) = &self.flow else { return };
        let available = self.available();
        if available <= self.low_watermark {
            if !self.low.swap(true, Ordering::AcqRel) {
                flow(true);
            }
        } else if available >= self.high_watermark && self.low.swap(false, Ordering::AcqRel) {
            flow(false);
        }
    }
}

/// One message slot; dropping the last clone releases it.
#[derive(Clone)]
pub struct PoolLease {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    factory: Arc<FactoryInner>,
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.factory.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.factory.check_watermarks();
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PoolLease")
    }
}

/// Bounded factory of [`Message`] envelopes.
pub struct MessageFactory {
    inner: Arc<FactoryInner>,
}

impl MessageFactory {
    pub fn new(
        capacity: usize,
        low_watermark: usize,
        high_watermark: usize,
        flow: Option<FlowControl>,
    ) -> Arc<MessageFactory> {
        Arc::new(MessageFactory {
            inner: Arc::new(FactoryInner {
                capacity,
                low_watermark,
                high_watermark,
                outstanding: AtomicUsize::new(0),
                low: AtomicBool::new(false),
                flow,
            }),
        })
    }

    /// Messages currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Free slots left.
    pub fn available(&self) -> usize {
        self.inner.available()
    }

    /// Mint a message against a pool slot; [`Error::OutOfMemory`] when the
    /// pool is exhausted.
    pub fn create(
        &self,
        source: Reference,
        target: Reference,
        payload: Payload,
    ) -> Result<Message> {
        let prev = self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        if prev >= self.inner.capacity {
            self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::OutOfMemory);
        }
        self.inner.check_watermarks();
        let mut message = Message::new(source, target, payload);
        message.lease = Some(PoolLease {
            inner: Arc::new(LeaseInner {
                factory: self.inner.clone(),
            }),
        });
        Ok(message)
    }

    /// Mint a data message with an empty receive buffer of `size` capacity.
    pub fn create_recv_buffer(
        &self,
        source: Reference,
        target: Reference,
        size: usize,
    ) -> Result<(Message, BytesMut)> {
        let message = self.create(
            source,
            target,
            Payload::Data {
                sequence_number: 0,
                source_address: Default::default(),
                buffer: Default::default(),
            },
        )?;
        Ok((message, BytesMut::with_capacity(size)))
    }
}
