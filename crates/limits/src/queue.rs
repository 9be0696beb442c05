//! Queue limiter: a bounded FIFO with a non-blocking producer side.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Limiter;
use crate::error::{LimitError, LimitResult};

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO shared by many producers and one consumer.
///
/// [`put`](Self::put) never waits: a full queue rejects the element with
/// [`LimitError::QueueFull`]. [`wait`](Self::wait) suspends the consumer until
/// an element arrives or the queue is closed.
#[derive(Debug)]
pub struct QueueLimiter<T> {
    key: String,
    capacity: usize,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> QueueLimiter<T> {
    /// Create a queue holding at most `capacity` elements.
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self {
            key: key.into(),
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Maximum number of queued elements.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `item`, failing immediately if the queue is full or closed.
    pub fn put(&self, item: T) -> LimitResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(LimitError::closed(&self.key));
            }
            if state.items.len() >= self.capacity {
                return Err(LimitError::QueueFull {
                    key: self.key.clone(),
                    capacity: self.capacity,
                });
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the oldest element, waiting for one if the queue is empty.
    ///
    /// Cancel-safe: an element is only removed when the future resolves.
    /// Returns [`LimitError::Closed`] once the queue is closed and drained.
    pub async fn wait(&self) -> LimitResult<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if state.closed {
                    return Err(LimitError::closed(&self.key));
                }
            }
            notified.await;
        }
    }
}

impl<T: Send> Limiter for QueueLimiter<T> {
    fn key(&self) -> &str {
        &self.key
    }

    fn close(&self) -> LimitResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(LimitError::closed(&self.key));
            }
            state.closed = true;
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
