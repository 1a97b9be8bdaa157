//! Bounded, deduplicating work queue
//!
//! Filesystem notifications arrive in bursts (an editor or `cp` writes a
//! file in several chunks, and a pair is two files). The queue collapses
//! repeated requests for the same certificate name into one pending item.
//! Pushes beyond capacity are dropped; the periodic full rescan picks up
//! anything lost that way.

use crate::error::QueueError;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Inner<T> {
    members: HashSet<T>,
    buffer: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// FIFO of unique pending items with a fixed (but growable) capacity
pub struct DedupQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Notify,
}

impl<T> std::fmt::Debug for DedupQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DedupQueue")
            .field("len", &inner.buffer.len())
            .field("capacity", &inner.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> DedupQueue<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                members: HashSet::with_capacity(capacity),
                buffer: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Enqueue `value` unless it is already pending or the queue is full.
    ///
    /// Returns whether the value was enqueued.
    pub fn push(&self, value: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed
                || inner.members.contains(&value)
                || inner.buffer.len() >= inner.capacity
            {
                return false;
            }
            inner.members.insert(value.clone());
            inner.buffer.push_back(value);
        }
        self.available.notify_one();
        true
    }

    /// Wait for the next item.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained, and
    /// [`QueueError::Cancelled`] if `cancel` fires first.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<Option<T>, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(value) = self.try_pop() {
                return Ok(Some(value));
            }
            if self.inner.lock().closed {
                return Ok(None);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let value = inner.buffer.pop_front()?;
        inner.members.remove(&value);
        Some(value)
    }

    /// Drop every pending item.
    pub fn empty(&self) {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.members.clear();
    }

    /// Grow capacity to `capacity`, keeping pending items and their order.
    ///
    /// Requests that do not increase capacity are ignored.
    pub fn expand(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        if capacity <= inner.capacity {
            return;
        }
        let mut buffer = VecDeque::with_capacity(capacity);
        buffer.extend(inner.buffer.drain(..));
        inner.buffer = buffer;
        let members = inner.members.len();
        inner.members.reserve(capacity.saturating_sub(members));
        inner.capacity = capacity;
    }

    /// Stop accepting items and wake pollers; they return `None` once the
    /// remaining items are drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }
}
