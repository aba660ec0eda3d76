use crossbeam::channel::{bounded, select, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result, StreamFailure};
use crate::link::{upstream_lost, Demand, Signal};

/// Determines how the buffer should handle overflow conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Suspend the writer until a slot frees up
    Block,
    /// Evict the oldest buffered item to make space
    DropOldest,
    /// Discard the incoming item
    DropNewest,
}

impl OverflowPolicy {
    /// Whether a full buffer with this policy holds back the splitter.
    ///
    /// Only `Block` does; drop policies always accept.
    pub fn gates_upstream(&self) -> bool {
        matches!(self, OverflowPolicy::Block)
    }
}

/// Result of offering an item to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Accepted after evicting the oldest item
    DroppedOldest,
    /// The offered item itself was discarded
    DroppedNewest,
    /// The reader is gone
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamEnd {
    Completed,
    Failed(StreamFailure),
    Aborted,
}

#[derive(Debug)]
struct Shared<T> {
    queue: ArrayQueue<T>,
    policy: OverflowPolicy,
    end: Mutex<Option<StreamEnd>>,
    reader_gone: AtomicBool,
    accepted: AtomicU64,
    dropped: AtomicU64,
    blocks: AtomicU64,
    high_water: AtomicUsize,
    item_ready_tx: Sender<()>,
    item_ready_rx: Receiver<()>,
    slot_freed_tx: Sender<()>,
    slot_freed_rx: Receiver<()>,
}

impl<T> Shared<T> {
    fn finish(&self, end: StreamEnd) {
        let mut slot = self.end.lock();
        if slot.is_none() {
            *slot = Some(end);
        }
        drop(slot);
        let _ = self.item_ready_tx.try_send(());
    }
}

/// Fixed-capacity FIFO between the splitter and one consumer.
///
/// This handle only observes the buffer; items go in through the single
/// [`BufferWriter`] and out through the single [`BufferReader`] returned by
/// [`BoundedBranchBuffer::channel`].
#[derive(Debug)]
pub struct BoundedBranchBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedBranchBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> BoundedBranchBuffer<T> {
    /// Create a buffer and its writer/reader ends
    pub fn channel(
        capacity: usize,
        policy: OverflowPolicy,
        cancel: &CancelToken,
    ) -> Result<(BufferWriter<T>, BufferReader<T>)> {
        if capacity == 0 {
            return Err(PipelineError::ConfigError(
                "buffer capacity must be at least 1".into(),
            ));
        }

        let (item_ready_tx, item_ready_rx) = bounded(1);
        let (slot_freed_tx, slot_freed_rx) = bounded(1);
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(capacity),
            policy,
            end: Mutex::new(None),
            reader_gone: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            high_water: AtomicUsize::new(0),
            item_ready_tx,
            item_ready_rx,
            slot_freed_tx,
            slot_freed_rx,
        });

        let writer = BufferWriter {
            buffer: BoundedBranchBuffer {
                shared: Arc::clone(&shared),
            },
            cancel: cancel.clone(),
            finished: false,
        };
        let reader = BufferReader {
            buffer: BoundedBranchBuffer { shared },
            cancel: cancel.clone(),
        };
        Ok((writer, reader))
    }
}

impl<T> BoundedBranchBuffer<T> {
    /// Get the current size of the buffer
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Get the utilization of the buffer as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() as u32 * 100) / self.capacity() as u32).min(100)
    }

    /// Items discarded by the overflow policy
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Times the writer had to suspend on a full buffer
    pub fn block_count(&self) -> u64 {
        self.shared.blocks.load(Ordering::Relaxed)
    }

    /// Largest length ever observed
    pub fn high_water(&self) -> usize {
        self.shared.high_water.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            policy: self.policy(),
            capacity: self.capacity(),
            len: self.len(),
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            dropped: self.dropped_count(),
            blocks: self.block_count(),
            high_water: self.high_water(),
        }
    }
}

/// Point-in-time counters of one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    pub policy: OverflowPolicy,
    pub capacity: usize,
    pub len: usize,
    pub accepted: u64,
    pub dropped: u64,
    pub blocks: u64,
    pub high_water: usize,
}

/// Inserting end, owned by the splitter
#[derive(Debug)]
pub struct BufferWriter<T> {
    buffer: BoundedBranchBuffer<T>,
    cancel: CancelToken,
    finished: bool,
}

impl<T> BufferWriter<T> {
    pub fn buffer(&self) -> &BoundedBranchBuffer<T> {
        &self.buffer
    }

    pub fn is_detached(&self) -> bool {
        self.buffer.shared.reader_gone.load(Ordering::Acquire)
    }

    /// Wait until an insertion would not suspend.
    ///
    /// Returns immediately for drop policies.
    pub fn wait_for_slot(&mut self) -> Result<Demand> {
        let shared = &self.buffer.shared;
        let mut counted = false;
        loop {
            if self.is_detached() {
                return Ok(Demand::Detached);
            }
            if !shared.policy.gates_upstream() || shared.queue.len() < shared.queue.capacity() {
                return Ok(Demand::Ready);
            }
            if !counted {
                shared.blocks.fetch_add(1, Ordering::Relaxed);
                counted = true;
            }
            select! {
                recv(shared.slot_freed_rx) -> _ => {},
                recv(self.cancel.signal()) -> _ => return Err(PipelineError::Cancelled),
            }
        }
    }

    /// Insert according to the buffer's overflow policy
    pub fn offer(&mut self, item: T) -> Result<Offer> {
        if self.is_detached() {
            return Ok(Offer::Detached);
        }

        let policy = self.buffer.shared.policy;
        let offer = match policy {
            OverflowPolicy::Block => {
                let mut item = item;
                loop {
                    if self.wait_for_slot()? == Demand::Detached {
                        return Ok(Offer::Detached);
                    }
                    match self.buffer.shared.queue.push(item) {
                        Ok(()) => break Offer::Accepted,
                        Err(back) => item = back,
                    }
                }
            }
            OverflowPolicy::DropOldest => match self.buffer.shared.queue.force_push(item) {
                None => Offer::Accepted,
                Some(_evicted) => Offer::DroppedOldest,
            },
            OverflowPolicy::DropNewest => match self.buffer.shared.queue.push(item) {
                Ok(()) => Offer::Accepted,
                Err(_discarded) => Offer::DroppedNewest,
            },
        };

        let shared = &self.buffer.shared;
        match offer {
            Offer::Accepted => {
                shared.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Offer::DroppedOldest => {
                shared.accepted.fetch_add(1, Ordering::Relaxed);
                shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Offer::DroppedNewest => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Offer::Detached => {}
        }
        if matches!(offer, Offer::Accepted | Offer::DroppedOldest) {
            shared.high_water.fetch_max(shared.queue.len(), Ordering::Relaxed);
            let _ = shared.item_ready_tx.try_send(());
        }
        Ok(offer)
    }

    /// No more items; the reader drains what is buffered, then completes
    pub fn complete(mut self) {
        self.finished = true;
        self.buffer.shared.finish(StreamEnd::Completed);
    }

    /// Terminate the reader immediately; buffered items are discarded
    pub fn fail(mut self, failure: StreamFailure) {
        self.finished = true;
        self.buffer.shared.finish(StreamEnd::Failed(failure));
    }
}

impl<T> Drop for BufferWriter<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.shared.finish(StreamEnd::Aborted);
        }
    }
}

/// Removing end, owned by the consumer
#[derive(Debug)]
pub struct BufferReader<T> {
    buffer: BoundedBranchBuffer<T>,
    cancel: CancelToken,
}

impl<T> BufferReader<T> {
    pub fn buffer(&self) -> &BoundedBranchBuffer<T> {
        &self.buffer
    }

    /// Take the oldest item, waiting while the buffer is empty and the
    /// writer has not finished
    pub fn pop(&mut self) -> Result<Signal<T>> {
        let shared = &self.buffer.shared;
        loop {
            // Read the end state before popping: an item pushed before
            // completion must still be seen.
            let end = shared.end.lock().clone();
            match end {
                Some(StreamEnd::Failed(failure)) => return Ok(Signal::Failed(failure)),
                Some(StreamEnd::Aborted) => return upstream_lost(&self.cancel),
                _ => {}
            }

            if let Some(item) = shared.queue.pop() {
                let _ = shared.slot_freed_tx.try_send(());
                return Ok(Signal::Item(item));
            }
            if end == Some(StreamEnd::Completed) {
                return Ok(Signal::Complete);
            }

            select! {
                recv(shared.item_ready_rx) -> _ => {},
                recv(self.cancel.signal()) -> _ => return Err(PipelineError::Cancelled),
            }
        }
    }
}

impl<T> Drop for BufferReader<T> {
    fn drop(&mut self) {
        self.buffer.shared.reader_gone.store(true, Ordering::Release);
        let _ = self.buffer.shared.slot_freed_tx.try_send(());
    }
}
