//! Bounded delivery queue between serial ingestion and the uplink
//!
//! The queue is the only point where the ingestion and publishing tasks meet.
//! It holds at most `capacity` readings in FIFO order. When full, the
//! [`OverflowPolicy`] decides whether the producer waits or the oldest
//! reading is evicted; eviction never reorders what remains.
//!
//! Closing the queue rejects new items while letting the consumer drain
//! whatever is still buffered.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{BridgeError, Result};

/// What happened to an enqueued item
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome<T> {
    /// Stored with room to spare
    Accepted,
    /// Stored after evicting the oldest item, returned here
    Displaced(T),
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted
    pub enqueued: u64,
    /// Items handed to the consumer
    pub dequeued: u64,
    /// Items evicted by drop-oldest
    pub dropped: u64,
    /// Items currently buffered
    pub len: usize,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
}

/// Bounded FIFO for one producer and one consumer
///
/// Cloning yields another handle to the same queue.
pub struct DeliveryQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DeliveryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> DeliveryQueue<T> {
    /// Create a queue; a zero capacity is raised to one
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                    enqueued: 0,
                    dequeued: 0,
                    dropped: 0,
                }),
                capacity,
                policy,
                item_ready: Notify::new(),
                space_ready: Notify::new(),
            }),
        }
    }

    /// Create a queue from configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity, config.overflow)
    }

    /// Maximum buffered items
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Overflow policy in effect
    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Add an item at the back
    ///
    /// Under [`OverflowPolicy::Block`] this waits for room. Fails with
    /// [`BridgeError::QueueClosed`] once [`close`](Self::close) was called.
    pub async fn enqueue(&self, item: T) -> Result<EnqueueOutcome<T>> {
        let mut item = Some(item);
        loop {
            let space = self.shared.space_ready.notified();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(BridgeError::QueueClosed);
                }

                if state.items.len() < self.shared.capacity {
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                    }
                    state.enqueued += 1;
                    drop(state);
                    self.shared.item_ready.notify_one();
                    return Ok(EnqueueOutcome::Accepted);
                }

                if self.shared.policy == OverflowPolicy::DropOldest {
                    let evicted = state.items.pop_front();
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                    }
                    state.enqueued += 1;
                    state.dropped += 1;
                    let dropped = state.dropped;
                    drop(state);
                    warn!(
                        capacity = self.shared.capacity,
                        dropped_total = dropped,
                        "Delivery queue full, dropped oldest reading"
                    );
                    self.shared.item_ready.notify_one();
                    return Ok(match evicted {
                        Some(evicted) => EnqueueOutcome::Displaced(evicted),
                        None => EnqueueOutcome::Accepted,
                    });
                }
            }

            debug!(capacity = self.shared.capacity, "Delivery queue full, waiting");
            space.await;
        }
    }

    /// Take the item at the front
    ///
    /// Waits while the queue is empty. Returns `None` once the queue is
    /// closed and fully drained.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let ready = self.shared.item_ready.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.items.pop_front() {
                    state.dequeued += 1;
                    drop(state);
                    self.shared.space_ready.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Take the front item without waiting
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            state.dequeued += 1;
            drop(state);
            self.shared.space_ready.notify_one();
        }
        item
    }

    /// Stop accepting items and wake any waiter
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.item_ready.notify_waiters();
        self.shared.item_ready.notify_one();
        self.shared.space_ready.notify_waiters();
        self.shared.space_ready.notify_one();
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            enqueued: state.enqueued,
            dequeued: state.dequeued,
            dropped: state.dropped,
            len: state.items.len(),
        }
    }
}
