//! Per-channel outbound queues.
//!
//! A connection carries several logical streams multiplexed by a
//! [`ChannelTag`]. Each tag gets its own FIFO; the transport writer drains the
//! non-empty FIFOs round-robin so a bulk transfer on one channel cannot starve
//! small messages on another. Order within a channel is always preserved.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Opaque identifier of a logical stream on one connection.
///
/// The server threads this through to the transport without interpreting it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelTag(Arc<str>);

impl ChannelTag {
    /// Create a tag.
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ChannelTag {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

type Key = Option<ChannelTag>;

struct Inner<T> {
    queues: HashMap<Key, VecDeque<T>>,
    // Channels with pending items, in service order. A key appears at most once.
    ready: VecDeque<Key>,
    len: usize,
    closed: bool,
}

/// Multi-producer, single-consumer queue with one FIFO per channel.
pub struct OutboundQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> OutboundQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                ready: VecDeque::new(),
                len: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append `item` to `channel`'s FIFO.
    ///
    /// Returns the item back if the queue has been closed.
    pub fn push(&self, channel: Option<ChannelTag>, item: T) -> Result<(), T> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(item);
            }
            let queue = inner.queues.entry(channel.clone()).or_default();
            let was_empty = queue.is_empty();
            queue.push_back(item);
            if was_empty {
                inner.ready.push_back(channel);
            }
            inner.len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next item, rotating to the following channel afterwards.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let key = inner.ready.pop_front()?;
        let (item, more) = match inner.queues.get_mut(&key) {
            Some(queue) => {
                let item = queue.pop_front();
                (item, !queue.is_empty())
            }
            None => (None, false),
        };
        if more {
            inner.ready.push_back(key);
        } else {
            let _ = inner.queues.remove(&key);
        }
        if item.is_some() {
            inner.len -= 1;
        }
        item
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and fully drained. Intended
    /// for a single consumer (the transport writer).
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.inner.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Reject further pushes and wake the consumer.
    ///
    /// Items already queued are still handed out by [`Self::next`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued items across all channels.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for OutboundQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for OutboundQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OutboundQueue")
            .field("len", &inner.len)
            .field("channels", &inner.ready.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
