//! Cooperative suspension
//!
//! A task body is a plain closure returning a [`Step`]. Returning
//! [`Step::Await`] (built with [`TaskContext::await_on`]) ends the current
//! run: the worker goes back to the pool and the rest of the computation is
//! parked as a continuation on the awaited future. When that future
//! terminates the continuation is submitted to the task's executor and the
//! driver picks up where the task left off.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::context::Executor;
use super::future::{CancellationToken, ContinuationTarget, Future, Outcome};
use super::task::{FutureId, TaskPriority, WorkItem};
use super::timer::Timer;
use super::SchedulerStats;
use crate::runtime::errors::{AwaitError, Canceled, OperationFault};

pub(crate) type Body<T> = Box<dyn FnOnce(&TaskContext) -> Step<T> + Send>;

/// What a task body hands back to the driver.
pub enum Step<T> {
    /// Finished with a value.
    Ready(T),
    /// Finished with a fault.
    Faulted(OperationFault),
    /// Stopped at a cancellation checkpoint.
    Canceled,
    /// Suspended on another future.
    Await(Suspend<T>),
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Step::Ready(_) => f.write_str("Ready(..)"),
            Step::Faulted(fault) => f.debug_tuple("Faulted").field(fault).finish(),
            Step::Canceled => f.write_str("Canceled"),
            Step::Await(_) => f.write_str("Await(..)"),
        }
    }
}

impl<T> Step<T> {
    /// Fault with `message`.
    #[inline]
    pub fn fault(message: impl fmt::Display) -> Self {
        Step::Faulted(OperationFault::new(message))
    }
}

impl<T, E: fmt::Display> From<Result<T, E>> for Step<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Step::Ready(value),
            Err(err) => Step::fault(err),
        }
    }
}

/// Re-surfaces an awaited failure as the awaiter's own outcome.
impl<T> From<AwaitError> for Step<T> {
    fn from(err: AwaitError) -> Self {
        match err {
            AwaitError::Faulted(fault) => Step::Faulted(fault),
            AwaitError::Canceled => Step::Canceled,
            AwaitError::TimedOut(after) => Step::Faulted(OperationFault::timed_out(after)),
        }
    }
}

impl<T> From<Canceled> for Step<T> {
    fn from(_: Canceled) -> Self {
        Step::Canceled
    }
}

/// Opaque suspension built by [`TaskContext::await_on`].
pub struct Suspend<T>(Box<dyn Suspension<T>>);

trait Suspension<T>: Send {
    /// Park the rest of the task on the awaited future.
    ///
    /// Returns the remainder when it can run right away.
    fn park(
        self: Box<Self>,
        task: TaskCore<T>,
    ) -> Option<Body<T>>;
}

/// Everything the driver needs to run (and resume) one task.
pub(crate) struct TaskCore<T> {
    pub(crate) future: Future<T>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) timer: Arc<Timer>,
    pub(crate) stats: Arc<SchedulerStats>,
}

impl<T> Clone for TaskCore<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
            executor: self.executor.clone(),
            timer: self.timer.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// View of the running task handed to its body.
pub struct TaskContext {
    id: FutureId,
    cancel: CancellationToken,
    executor: Arc<dyn Executor>,
}

impl fmt::Debug for TaskContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("cancel_requested", &self.cancel.is_canceled())
            .finish()
    }
}

impl TaskContext {
    /// Id of the future this task resolves.
    #[inline]
    pub fn id(&self) -> FutureId {
        self.id
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Cancellation checkpoint, e.g. at the top of every loop iteration.
    ///
    /// ```ignore
    /// for chunk in chunks {
    ///     if let Err(canceled) = cx.checkpoint() {
    ///         return canceled.into();
    ///     }
    ///     process(chunk);
    /// }
    /// ```
    #[inline]
    pub fn checkpoint(&self) -> Result<(), Canceled> {
        if self.cancel.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Continuation target that resumes on the executor running this task.
    #[inline]
    pub fn target(&self) -> ContinuationTarget {
        ContinuationTarget::Executor(self.executor.clone())
    }

    /// Suspend until `future` terminates, then continue with `then`.
    ///
    /// Entering an await is a cancellation checkpoint. The worker is released
    /// while the future is pending; if it is already terminal, `then` runs
    /// right away on the current worker.
    pub fn await_on<U, T, F>(
        &self,
        future: &Future<U>,
        then: F,
    ) -> Step<T>
    where
        U: Clone + Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce(Result<U, AwaitError>, &TaskContext) -> Step<T> + Send + 'static,
    {
        self.suspend(future, None, None, then)
    }

    /// Like [`TaskContext::await_on`], giving up after `timeout`.
    ///
    /// On timeout `then` receives [`AwaitError::TimedOut`]; the awaited
    /// future is unaffected and its late outcome is dropped for this waiter
    /// only.
    pub fn await_timeout<U, T, F>(
        &self,
        future: &Future<U>,
        timeout: Duration,
        then: F,
    ) -> Step<T>
    where
        U: Clone + Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce(Result<U, AwaitError>, &TaskContext) -> Step<T> + Send + 'static,
    {
        self.suspend(future, Some(timeout), None, then)
    }

    /// Like [`TaskContext::await_on`], resuming on `target` instead of the
    /// current executor (for example a [`LocalContext`](super::LocalContext)).
    pub fn await_on_context<U, T, F>(
        &self,
        future: &Future<U>,
        target: ContinuationTarget,
        then: F,
    ) -> Step<T>
    where
        U: Clone + Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce(Result<U, AwaitError>, &TaskContext) -> Step<T> + Send + 'static,
    {
        self.suspend(future, None, Some(target), then)
    }

    fn suspend<U, T, F>(
        &self,
        future: &Future<U>,
        timeout: Option<Duration>,
        target: Option<ContinuationTarget>,
        then: F,
    ) -> Step<T>
    where
        U: Clone + Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce(Result<U, AwaitError>, &TaskContext) -> Step<T> + Send + 'static,
    {
        if self.checkpoint().is_err() {
            return Step::Canceled;
        }
        Step::Await(Suspend(Box::new(AwaitOn {
            awaited: future.clone(),
            timeout,
            target,
            then,
        })))
    }
}

struct AwaitOn<U, F> {
    awaited: Future<U>,
    timeout: Option<Duration>,
    target: Option<ContinuationTarget>,
    then: F,
}

impl<U, T, F> Suspension<T> for AwaitOn<U, F>
where
    U: Clone + Send + 'static,
    T: Clone + Send + 'static,
    F: FnOnce(Result<U, AwaitError>, &TaskContext) -> Step<T> + Send + 'static,
{
    fn park(
        self: Box<Self>,
        task: TaskCore<T>,
    ) -> Option<Body<T>> {
        let AwaitOn {
            awaited,
            timeout,
            target,
            then,
        } = *self;

        // An explicit target elsewhere always gets a hop, even when no wait is needed.
        let stays_here = match &target {
            Some(ContinuationTarget::Executor(executor)) => executor.is_current(),
            _ => true,
        };
        if stays_here {
            if let Some(outcome) = awaited.try_outcome() {
                task.stats.record_inline_resume();
                return Some(Box::new(move |cx| then(outcome.into_result(), cx)));
            }
        }

        task.stats.record_suspension();
        trace!(task = %task.future.id(), awaited = %awaited.id(), "task suspended");

        let (target, resumed) = match target {
            Some(ContinuationTarget::Executor(executor)) => {
                let mut resumed = task.clone();
                resumed.executor = executor.clone();
                (ContinuationTarget::Executor(executor), resumed)
            }
            Some(ContinuationTarget::Inline) => (ContinuationTarget::Inline, task.clone()),
            None => (ContinuationTarget::Executor(task.executor.clone()), task.clone()),
        };

        let Some(timeout) = timeout else {
            awaited.on_complete(
                move |outcome: Outcome<U>| {
                    drive(resumed, Box::new(move |cx| then(outcome.into_result(), cx)));
                },
                target,
            );
            return None;
        };

        // Whichever of completion and timeout takes `then` first resumes the task.
        let then = Arc::new(Mutex::new(Some(then)));
        let on_complete = then.clone();
        let completed = resumed.clone();
        awaited.on_complete_watched(
            move |outcome: Outcome<U>| {
                if let Some(then) = on_complete.lock().take() {
                    drive(completed, Box::new(move |cx| then(outcome.into_result(), cx)));
                }
            },
            target,
        );

        let deadline = Instant::now() + timeout;
        let timer = task.timer.clone();
        timer.schedule_at(deadline, move || {
            if let Some(then) = then.lock().take() {
                trace!(task = %resumed.future.id(), ?timeout, "await timed out");
                awaited.unwatch();
                let executor = resumed.executor.clone();
                resume_on(
                    executor,
                    resumed,
                    Box::new(move |cx| then(Err(AwaitError::TimedOut(timeout)), cx)),
                );
            }
        });
        None
    }
}

/// Submit the rest of a task to `executor`, running it inline if rejected.
fn resume_on<T: Clone + Send + 'static>(
    executor: Arc<dyn Executor>,
    task: TaskCore<T>,
    body: Body<T>,
) {
    let pending = Arc::new(Mutex::new(Some((task, body))));
    let queued = pending.clone();
    let item = WorkItem::new(TaskPriority::High, move || {
        if let Some((task, body)) = queued.lock().take() {
            drive(task, body);
        }
    });
    if let Err(err) = executor.execute(item) {
        warn!(error = %err, "executor rejected resumed task, running inline");
        if let Some((task, body)) = pending.lock().take() {
            drive(task, body);
        }
    }
}

/// Run a task until it terminates or parks on another future.
pub(crate) fn drive<T: Clone + Send + 'static>(
    task: TaskCore<T>,
    body: Body<T>,
) {
    let mut body = body;
    loop {
        // Checkpoint on entry and on every resume.
        if task.future.is_cancel_requested() {
            finish(&task, Outcome::Canceled);
            return;
        }
        if !task.future.start() {
            return;
        }

        let cx = TaskContext {
            id: task.future.id(),
            cancel: task.future.cancellation_token(),
            executor: task.executor.clone(),
        };
        let started = Instant::now();
        let step = match panic::catch_unwind(AssertUnwindSafe(move || body(&cx))) {
            Ok(step) => step,
            Err(payload) => Step::Faulted(OperationFault::from_panic(payload)),
        };
        task.stats.record_run(started.elapsed());

        match step {
            Step::Ready(value) => return finish(&task, Outcome::Completed(value)),
            Step::Faulted(fault) => return finish(&task, Outcome::Faulted(fault)),
            Step::Canceled => return finish(&task, Outcome::Canceled),
            Step::Await(Suspend(suspension)) => match suspension.park(task.clone()) {
                Some(next) => body = next,
                None => return,
            },
        }
    }
}

fn finish<T: Clone + Send + 'static>(
    task: &TaskCore<T>,
    outcome: Outcome<T>,
) {
    task.stats.record_outcome(&outcome);
    task.future.complete(outcome);
}
