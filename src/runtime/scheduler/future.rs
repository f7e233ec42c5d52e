//! Futures and continuations
//!
//! A [`Future`] is a shared handle to an operation's eventual [`Outcome`].
//! Its state only moves forward
//! (`Pending → Running → Completed | Faulted | Canceled`) and terminal states
//! are sinks. Continuations registered before the terminal transition are
//! frozen together with it and fired exactly once, in registration order;
//! continuations registered afterwards fire immediately.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{error, trace, warn};

use super::context::Executor;
use super::task::{FutureId, FutureState, TaskPriority, WorkItem, IDS};
use crate::runtime::diagnostics::{default_sink, DiagnosticEvent, DiagnosticSink};
use crate::runtime::errors::{AwaitError, OperationFault};

/// Terminal payload of a future.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Completed(T),
    Faulted(OperationFault),
    Canceled,
}

impl<T> Outcome<T> {
    /// The terminal state this outcome corresponds to.
    #[inline]
    pub fn state(&self) -> FutureState {
        match self {
            Outcome::Completed(_) => FutureState::Completed,
            Outcome::Faulted(_) => FutureState::Faulted,
            Outcome::Canceled => FutureState::Canceled,
        }
    }

    /// The value, or the error an awaiter sees.
    pub fn into_result(self) -> Result<T, AwaitError> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Faulted(fault) => Err(AwaitError::Faulted(fault)),
            Outcome::Canceled => Err(AwaitError::Canceled),
        }
    }
}

/// Where a continuation runs once its future terminates.
#[derive(Debug, Clone)]
pub enum ContinuationTarget {
    /// On the thread that completes the future (or registers the
    /// continuation, if the future is already terminal).
    Inline,
    /// As a new work item on the given executor.
    Executor(Arc<dyn Executor>),
}

impl ContinuationTarget {
    #[inline]
    pub fn executor<E: Executor + 'static>(executor: E) -> Self {
        ContinuationTarget::Executor(Arc::new(executor))
    }
}

/// Shared cancellation flag of a future.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

/// Code registered to run once a future terminates.
pub struct Continuation<T> {
    future_id: FutureId,
    callback: Callback<T>,
    target: ContinuationTarget,
}

impl<T> std::fmt::Debug for Continuation<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("future_id", &self.future_id)
            .field("target", &self.target)
            .finish()
    }
}

impl<T: Send + 'static> Continuation<T> {
    /// Consume the continuation, delivering `outcome` to its target.
    ///
    /// If the target executor rejects the item (it was shut down) the
    /// callback runs inline instead of being lost.
    fn fire(
        self,
        outcome: Outcome<T>,
    ) {
        let Continuation {
            future_id,
            callback,
            target,
        } = self;

        #[cfg(feature = "debug")]
        tracing::trace!(future = %future_id, state = ?outcome.state(), ?target, "firing continuation");

        match target {
            ContinuationTarget::Inline => run_callback(future_id, callback, outcome),
            ContinuationTarget::Executor(executor) => {
                let pending = Arc::new(Mutex::new(Some((callback, outcome))));
                let queued = pending.clone();
                let item = WorkItem::new(TaskPriority::High, move || {
                    if let Some((callback, outcome)) = queued.lock().take() {
                        run_callback(future_id, callback, outcome);
                    }
                });
                if let Err(err) = executor.execute(item) {
                    warn!(future = %future_id, error = %err, "continuation target rejected item, running inline");
                    if let Some((callback, outcome)) = pending.lock().take() {
                        run_callback(future_id, callback, outcome);
                    }
                }
            }
        }
    }
}

/// Run one callback, containing a panic so the remaining continuations still fire.
fn run_callback<T>(
    future_id: FutureId,
    callback: Callback<T>,
    outcome: Outcome<T>,
) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        error!(future = %future_id, "continuation panicked");
    }
}

struct Inner<T> {
    state: FutureState,
    outcome: Option<Outcome<T>>,
    continuations: SmallVec<[Continuation<T>; 2]>,
}

pub(crate) struct Shared<T> {
    id: FutureId,
    inner: Mutex<Inner<T>>,
    done: Condvar,
    cancel: CancellationToken,
    observed: AtomicBool,
    /// Timed waiters that have not given up yet.
    watchers: AtomicUsize,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if self.observed.load(Ordering::Acquire) || self.watchers.load(Ordering::Acquire) > 0 {
            return;
        }
        if let Some(Outcome::Faulted(fault)) = self.inner.get_mut().outcome.take() {
            self.diagnostics.emit(DiagnosticEvent::UnobservedFault {
                future_id: self.id,
                fault,
            });
        }
    }
}

/// Handle to an operation's eventual value, fault or cancellation.
///
/// Cloning the handle shares the same operation.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Future<T> {
    pub(crate) fn new(diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: IDS.next_future(),
                inner: Mutex::new(Inner {
                    state: FutureState::Pending,
                    outcome: None,
                    continuations: SmallVec::new(),
                }),
                done: Condvar::new(),
                cancel: CancellationToken::new(),
                observed: AtomicBool::new(false),
                watchers: AtomicUsize::new(0),
                diagnostics,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> FutureId {
        self.shared.id
    }

    #[inline]
    pub fn state(&self) -> FutureState {
        self.shared.inner.lock().state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cooperative cancellation.
    ///
    /// The operation moves to `Canceled` the next time it reaches a
    /// checkpoint; work that never checks runs to completion. Returns `false`
    /// if the future was already terminal.
    pub fn cancel(&self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.shared.cancel.cancel();
        trace!(future = %self.shared.id, "cancellation requested");
        true
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_canceled()
    }

    /// The flag [`Future::cancel`] sets, for checking from inside the operation.
    #[inline]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Number of continuations waiting for the terminal transition.
    pub fn pending_continuations(&self) -> usize {
        self.shared.inner.lock().continuations.len()
    }

    /// `Pending → Running`. Returns `false` if the future is already terminal.
    pub(crate) fn start(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            FutureState::Pending => {
                inner.state = FutureState::Running;
                true
            }
            FutureState::Running => true,
            _ => false,
        }
    }

    #[inline]
    pub(crate) fn mark_observed(&self) {
        self.shared.observed.store(true, Ordering::Release);
    }

    /// A timed waiter gave up; it no longer counts as observing a fault.
    #[inline]
    pub(crate) fn unwatch(&self) {
        self.shared.watchers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether this handle is the only reference and nothing is registered on it.
    fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.shared) == 1 && self.shared.inner.lock().continuations.is_empty()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// A future that is already completed with `value`.
    pub fn ready(value: T) -> Self {
        let future = Self::new(default_sink());
        future.complete(Outcome::Completed(value));
        future
    }

    /// A future that is already faulted.
    pub fn faulted(fault: OperationFault) -> Self {
        let future = Self::new(default_sink());
        future.complete(Outcome::Faulted(fault));
        future
    }

    /// Move to a terminal state and fire every registered continuation.
    ///
    /// Returns `false` (and changes nothing) if already terminal.
    pub(crate) fn complete(
        &self,
        outcome: Outcome<T>,
    ) -> bool {
        let continuations = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = outcome.state();
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.continuations)
        };
        self.shared.done.notify_all();

        trace!(
            future = %self.shared.id,
            state = ?outcome.state(),
            continuations = continuations.len(),
            "future terminated"
        );
        for continuation in continuations {
            continuation.fire(outcome.clone());
        }
        true
    }

    /// Register `callback` to receive the outcome, run on `target`.
    ///
    /// Fires exactly once. Registering on a terminal future fires right away.
    pub fn on_complete<F>(
        &self,
        callback: F,
        target: ContinuationTarget,
    ) where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.mark_observed();
        self.register(callback, target);
    }

    /// Like [`Future::on_complete`] for a waiter that may time out.
    ///
    /// The waiter counts as an observer until it calls [`Future::unwatch`].
    pub(crate) fn on_complete_watched<F>(
        &self,
        callback: F,
        target: ContinuationTarget,
    ) where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.shared.watchers.fetch_add(1, Ordering::AcqRel);
        self.register(callback, target);
    }

    fn register<F>(
        &self,
        callback: F,
        target: ContinuationTarget,
    ) where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let continuation = Continuation {
            future_id: self.shared.id,
            callback: Box::new(callback),
            target,
        };

        let outcome = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    inner.continuations.push(continuation);
                    return;
                }
            }
        };
        continuation.fire(outcome);
    }

    /// The outcome, if the future is terminal.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        let outcome = self.shared.inner.lock().outcome.clone();
        if outcome.is_some() {
            self.mark_observed();
        }
        outcome
    }

    /// Block the calling thread until the future terminates.
    ///
    /// For code outside the pool. Tasks running on a worker should suspend
    /// with [`TaskContext::await_on`](super::TaskContext::await_on) instead,
    /// which releases the worker.
    pub fn wait(&self) -> Result<T, AwaitError> {
        let mut inner = self.shared.inner.lock();
        while inner.outcome.is_none() {
            self.shared.done.wait(&mut inner);
        }
        self.mark_observed();
        inner
            .outcome
            .clone()
            .map(Outcome::into_result)
            .unwrap_or(Err(AwaitError::Canceled))
    }

    /// Like [`Future::wait`], giving up after `timeout`.
    ///
    /// A timeout only affects this waiter; the operation keeps running.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> Result<T, AwaitError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while inner.outcome.is_none() {
            if self.shared.done.wait_until(&mut inner, deadline).timed_out() && inner.outcome.is_none() {
                return Err(AwaitError::TimedOut(timeout));
            }
        }
        self.mark_observed();
        inner
            .outcome
            .clone()
            .map(Outcome::into_result)
            .unwrap_or(Err(AwaitError::Canceled))
    }
}

/// Completion source for a future driven from outside the scheduler.
///
/// Dropping an unresolved promise faults its future, so awaiters never hang.
/// A future nobody else holds or waits on is left alone.
#[derive(Debug)]
pub struct Promise<T: Clone + Send + 'static> {
    future: Future<T>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self::with_diagnostics(default_sink())
    }

    pub fn with_diagnostics(diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        let future = Future::new(diagnostics);
        future.start();
        Self { future }
    }

    /// The future resolved by this promise.
    #[inline]
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    /// Whether a consumer asked the operation to stop.
    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.future.is_cancel_requested()
    }

    pub fn complete(
        &self,
        value: T,
    ) -> bool {
        self.future.complete(Outcome::Completed(value))
    }

    pub fn fail(
        &self,
        fault: OperationFault,
    ) -> bool {
        self.future.complete(Outcome::Faulted(fault))
    }

    pub fn cancel(&self) -> bool {
        self.future.complete(Outcome::Canceled)
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.future.is_terminal() && !self.future.is_orphaned() {
            self.future
                .complete(Outcome::Faulted(OperationFault::new("promise dropped before completion")));
        }
    }
}
