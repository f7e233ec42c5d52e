//! Work items and identifiers for the scheduler.
//!
//! A [`WorkItem`] is the unit the queue and the workers move around: an
//! opaque callable plus the metadata needed to order it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Unique work item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Unique future identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FutureId(pub u64);

impl FutureId {
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FutureId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Future({})", self.0)
    }
}

/// Thread-safe generator for identifiers.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next_id: AtomicU64,
}

impl IdGenerator {
    #[inline]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn next_task(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn next_future(&self) -> FutureId {
        FutureId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process-wide id source; ids are unique across schedulers.
pub(crate) static IDS: IdGenerator = IdGenerator::new();

/// Lifecycle of a future.
///
/// `Completed`, `Faulted` and `Canceled` are terminal: once reached the
/// state never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FutureState {
    /// Created, not yet picked up by a worker.
    Pending,
    /// A worker is executing (or the task is suspended on an await).
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an [`OperationFault`](crate::runtime::OperationFault).
    Faulted,
    /// Observed its cancellation flag at a checkpoint.
    Canceled,
}

impl FutureState {
    /// Whether the state is a sink.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FutureState::Completed | FutureState::Faulted | FutureState::Canceled
        )
    }
}

/// Task priority levels.
///
/// Higher tiers are dequeued first. Continuations are submitted at
/// [`TaskPriority::High`] so nearly-finished work overtakes fresh work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Default, Hash, Serialize)]
pub enum TaskPriority {
    /// Low priority tasks.
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority tasks.
    High = 2,
    /// Critical priority tasks.
    Critical = 3,
}

impl TaskPriority {
    /// Number of priority tiers.
    pub const TIERS: usize = 4;

    /// Index of the queue tier, 0 being the first one served.
    #[inline]
    pub fn tier(&self) -> usize {
        Self::TIERS - 1 - (*self as usize)
    }
}

/// A runnable unit of work.
pub struct WorkItem {
    id: TaskId,
    priority: TaskPriority,
    enqueue_time: Instant,
    action: Box<dyn FnOnce() + Send>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("enqueue_time", &self.enqueue_time)
            .finish()
    }
}

impl WorkItem {
    /// Create a work item with a fresh id.
    pub fn new<F>(
        priority: TaskPriority,
        action: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_id(IDS.next_task(), priority, action)
    }

    pub fn with_id<F>(
        id: TaskId,
        priority: TaskPriority,
        action: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id,
            priority,
            enqueue_time: Instant::now(),
            action: Box::new(action),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// When the item was created (and handed to a queue).
    #[inline]
    pub fn enqueue_time(&self) -> Instant {
        self.enqueue_time
    }

    /// Run the action, consuming the item.
    #[inline]
    pub fn run(self) {
        (self.action)()
    }
}
