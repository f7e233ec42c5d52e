//! Work queue for the scheduler
//!
//! Multi-producer, multi-consumer queue with priority tiers. Items of a
//! higher tier are always dequeued first; inside a tier the order is FIFO.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::task::{TaskPriority, WorkItem};
use crate::runtime::errors::{SchedulerError, SchedulerResult};

/// Result of a dequeue attempt.
#[derive(Debug)]
pub enum Dequeued {
    /// An item was removed from the queue.
    Item(WorkItem),
    /// The queue is shut down and fully drained.
    Shutdown,
    /// A bounded wait elapsed with nothing to dequeue.
    TimedOut,
}

impl Dequeued {
    /// Convert into the item, if any.
    #[inline]
    pub fn into_item(self) -> Option<WorkItem> {
        match self {
            Dequeued::Item(item) => Some(item),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// One FIFO per priority, index 0 served first.
    tiers: [VecDeque<WorkItem>; TaskPriority::TIERS],
    len: usize,
    closed: bool,
}

impl QueueState {
    fn pop(&mut self) -> Option<WorkItem> {
        for tier in self.tiers.iter_mut() {
            if let Some(item) = tier.pop_front() {
                self.len -= 1;
                return Some(item);
            }
        }
        None
    }
}

/// A thread-safe priority work queue.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: Option<usize>,
}

impl WorkQueue {
    /// Create an unbounded queue.
    #[inline]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity: None,
        }
    }

    /// Create a queue that rejects items beyond `capacity`.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Add an item. Never blocks.
    ///
    /// Fails with [`SchedulerError::QueueClosed`] after [`WorkQueue::close`],
    /// or [`SchedulerError::QueueFull`] when a configured capacity is reached.
    pub fn enqueue(
        &self,
        item: WorkItem,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SchedulerError::QueueClosed);
        }
        if let Some(capacity) = self.capacity {
            if state.len >= capacity {
                return Err(SchedulerError::QueueFull { capacity });
            }
        }
        let tier = item.priority().tier();
        state.tiers[tier].push_back(item);
        state.len += 1;
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Remove the next item, blocking until one is available.
    ///
    /// After shutdown the remaining items are still handed out; once the queue
    /// is empty every caller receives [`Dequeued::Shutdown`].
    pub fn dequeue(&self) -> Dequeued {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.pop() {
                return Dequeued::Item(item);
            }
            if state.closed {
                return Dequeued::Shutdown;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`WorkQueue::dequeue`], giving up after `timeout`.
    pub fn dequeue_timeout(
        &self,
        timeout: Duration,
    ) -> Dequeued {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.pop() {
                return Dequeued::Item(item);
            }
            if state.closed {
                return Dequeued::Shutdown;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return match state.pop() {
                    Some(item) => Dequeued::Item(item),
                    None if state.closed => Dequeued::Shutdown,
                    None => Dequeued::TimedOut,
                };
            }
        }
    }

    /// Remove the next item without blocking.
    #[inline]
    pub fn try_dequeue(&self) -> Option<WorkItem> {
        self.state.lock().pop()
    }

    /// Stop accepting items and wake every blocked consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Get the number of queued items.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued items per priority, highest first.
    pub fn depth_by_priority(&self) -> [usize; TaskPriority::TIERS] {
        let state = self.state.lock();
        let mut depths = [0; TaskPriority::TIERS];
        for (depth, tier) in depths.iter_mut().zip(state.tiers.iter()) {
            *depth = tier.len();
        }
        depths
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
