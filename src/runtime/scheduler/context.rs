//! Execution contexts
//!
//! An [`Executor`] is anything that can accept a [`WorkItem`]: the worker
//! pool, or a [`LocalContext`], a designated single-threaded context whose
//! items only ever run on the thread driving it.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use super::future::{ContinuationTarget, Future};
use super::queue::{Dequeued, WorkQueue};
use super::task::{TaskPriority, WorkItem};
use crate::runtime::errors::{AwaitError, OperationFault, SchedulerResult};

/// Something that runs work items.
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Accept an item for execution.
    fn execute(
        &self,
        item: WorkItem,
    ) -> SchedulerResult<()>;

    /// Whether the calling thread is currently running items of this executor.
    fn is_current(&self) -> bool {
        false
    }
}

thread_local! {
    static CURRENT_LOCAL: Cell<Option<u64>> = const { Cell::new(None) };
}

static LOCAL_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct LocalShared {
    id: u64,
    queue: WorkQueue,
}

/// Handle for sending work to a [`LocalContext`] from any thread.
#[derive(Debug, Clone)]
pub struct LocalHandle {
    shared: Arc<LocalShared>,
}

impl LocalHandle {
    /// Continuation target resuming on this context.
    #[inline]
    pub fn target(&self) -> ContinuationTarget {
        ContinuationTarget::executor(self.clone())
    }
}

impl Executor for LocalHandle {
    fn execute(
        &self,
        item: WorkItem,
    ) -> SchedulerResult<()> {
        self.shared.queue.enqueue(item)
    }

    fn is_current(&self) -> bool {
        CURRENT_LOCAL.with(|current| current.get() == Some(self.shared.id))
    }
}

/// A designated single-threaded context.
///
/// Work sent to it queues up until the owning thread drives the context with
/// [`LocalContext::run`], [`LocalContext::run_pending`] or
/// [`LocalContext::block_on`].
#[derive(Debug)]
pub struct LocalContext {
    shared: Arc<LocalShared>,
}

impl LocalContext {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LocalShared {
                id: LOCAL_IDS.fetch_add(1, Ordering::Relaxed),
                queue: WorkQueue::new(),
            }),
        }
    }

    #[inline]
    pub fn handle(&self) -> LocalHandle {
        LocalHandle {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn target(&self) -> ContinuationTarget {
        self.handle().target()
    }

    /// Number of items waiting to run.
    #[inline]
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Run items on the calling thread until the context is shut down and drained.
    pub fn run(&self) {
        let _guard = self.enter();
        while let Dequeued::Item(item) = self.shared.queue.dequeue() {
            run_local(item);
        }
        debug!(context = self.shared.id, "local context finished");
    }

    /// Run whatever is queued right now without blocking. Returns how many items ran.
    pub fn run_pending(&self) -> usize {
        let _guard = self.enter();
        let mut ran = 0;
        while let Some(item) = self.shared.queue.try_dequeue() {
            run_local(item);
            ran += 1;
        }
        ran
    }

    /// Drive the context until `future` reaches a terminal state.
    ///
    /// Continuations targeting this context keep running meanwhile, so a
    /// future that resumes here cannot deadlock its own waiter.
    pub fn block_on<T>(
        &self,
        future: &Future<T>,
    ) -> Result<T, AwaitError>
    where
        T: Clone + Send + 'static,
    {
        let wake = self.handle();
        future.on_complete(
            move |_| {
                // Wake a blocked dequeue; a closed context is already awake.
                let _ = wake.execute(WorkItem::new(TaskPriority::Critical, || {}));
            },
            ContinuationTarget::Inline,
        );

        let _guard = self.enter();
        while !future.is_terminal() {
            match self.shared.queue.dequeue() {
                Dequeued::Item(item) => run_local(item),
                _ => break,
            }
        }
        future.wait()
    }

    /// Stop accepting items. Items already queued still run.
    pub fn shutdown(&self) {
        self.shared.queue.close();
    }

    fn enter(&self) -> EnterGuard {
        let previous = CURRENT_LOCAL.with(|current| current.replace(Some(self.shared.id)));
        EnterGuard { previous }
    }
}

impl Default for LocalContext {
    fn default() -> Self {
        Self::new()
    }
}

struct EnterGuard {
    previous: Option<u64>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT_LOCAL.with(|current| current.set(self.previous));
    }
}

fn run_local(item: WorkItem) {
    let task = item.id();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.run())) {
        let fault = OperationFault::from_panic(payload);
        error!(task = %task, fault = %fault, "local work item panicked");
    }
}
