//! Sample sinks
//!
//! The pacer hands chunks over without ever blocking: a full sink drops the
//! chunk and the push reports `false`.

use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::samples::SampleChunk;

/// Consumer of delivered sample chunks
pub trait SampleSink: Send + Sync {
    /// Offer a chunk; must return quickly. `false` means it was dropped.
    fn push(&self, chunk: SampleChunk) -> bool;
}

/// Lock-free bounded queue of chunks
pub struct QueueSink {
    queue: ArrayQueue<SampleChunk>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl QueueSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Pop a chunk, counting an underrun when empty
    pub fn pop(&self) -> Option<SampleChunk> {
        match self.queue.pop() {
            Some(chunk) => Some(chunk),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop without counting an underrun
    pub fn try_pop(&self) -> Option<SampleChunk> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

impl SampleSink for QueueSink {
    fn push(&self, chunk: SampleChunk) -> bool {
        match self.queue.push(chunk) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Sink backed by a bounded crossbeam channel
pub struct ChannelSink {
    tx: Sender<SampleChunk>,
}

impl ChannelSink {
    /// Create a sink and the receiving end for the consumer
    pub fn bounded(capacity: usize) -> (Self, Receiver<SampleChunk>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl SampleSink for ChannelSink {
    fn push(&self, chunk: SampleChunk) -> bool {
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Thread-safe handle to a sink
pub type SharedSink = Arc<dyn SampleSink>;
