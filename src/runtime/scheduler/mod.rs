//! Task scheduler for cooperative execution
//!
//! The [`Scheduler`] wraps submitted work in a [`Future`], runs it on a
//! [`WorkerPool`] and wires continuations between futures. Tasks suspend
//! cooperatively by returning [`Step::Await`] from their body (see
//! [`TaskContext::await_on`]); the worker is released until the awaited future
//! terminates.

pub mod context;
pub mod future;
pub mod pool;
pub mod queue;
pub mod suspend;
pub mod task;
pub mod timer;

pub use context::{Executor, LocalContext, LocalHandle};
pub use future::{CancellationToken, Continuation, ContinuationTarget, Future, Outcome, Promise};
pub use pool::{PoolConfig, PoolHandle, PoolStats, ThreadSpawner, WorkerId, WorkerPool, WorkerSpawner};
pub use queue::{Dequeued, WorkQueue};
pub use suspend::{Step, Suspend, TaskContext};
pub use task::{FutureId, FutureState, IdGenerator, TaskId, TaskPriority, WorkItem};
pub use timer::Timer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::runtime::diagnostics::DiagnosticSink;
use crate::runtime::errors::{AwaitError, SchedulerResult};
use crate::util::logger::TracingSink;
use suspend::{drive, Body, TaskCore};

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks scheduled.
    pub tasks_scheduled: AtomicU64,
    /// Tasks that completed with a value.
    pub tasks_completed: AtomicU64,
    /// Tasks that faulted (error or panic).
    pub tasks_faulted: AtomicU64,
    /// Tasks that stopped at a cancellation checkpoint.
    pub tasks_canceled: AtomicU64,
    /// Awaits that released the worker.
    pub suspensions: AtomicU64,
    /// Awaits on already-terminal futures, resumed without a queue round-trip.
    pub inline_resumes: AtomicU64,
    /// Time spent running task bodies, in microseconds.
    pub total_exec_time_us: AtomicU64,
}

impl SchedulerStats {
    /// Record a scheduled task.
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inline_resume(&self) {
        self.inline_resumes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one run of a task body.
    #[inline]
    pub fn record_run(
        &self,
        elapsed: Duration,
    ) {
        self.total_exec_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record how a task ended.
    pub fn record_outcome<T>(
        &self,
        outcome: &Outcome<T>,
    ) {
        let counter = match outcome {
            Outcome::Completed(_) => &self.tasks_completed,
            Outcome::Faulted(_) => &self.tasks_faulted,
            Outcome::Canceled => &self.tasks_canceled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_faulted: self.tasks_faulted.load(Ordering::Relaxed),
            tasks_canceled: self.tasks_canceled.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            inline_resumes: self.inline_resumes.load(Ordering::Relaxed),
            total_exec_time_us: self.total_exec_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`SchedulerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_faulted: u64,
    pub tasks_canceled: u64,
    pub suspensions: u64,
    pub inline_resumes: u64,
    pub total_exec_time_us: u64,
}

/// Builder for a [`Scheduler`].
pub struct SchedulerBuilder {
    config: PoolConfig,
    diagnostics: Arc<dyn DiagnosticSink>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl SchedulerBuilder {
    #[inline]
    pub fn pool(
        mut self,
        config: PoolConfig,
    ) -> Self {
        self.config = config;
        self
    }

    #[inline]
    pub fn workers(
        mut self,
        min: usize,
        max: usize,
    ) -> Self {
        self.config.min_workers = min;
        self.config.max_workers = max;
        self
    }

    #[inline]
    pub fn idle_timeout(
        mut self,
        idle_timeout: Duration,
    ) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    #[inline]
    pub fn saturation_threshold(
        mut self,
        threshold: usize,
    ) -> Self {
        self.config.saturation_threshold = threshold;
        self
    }

    /// Where `PoolSaturated` and `UnobservedFault` events go.
    #[inline]
    pub fn diagnostics(
        mut self,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Replace the thread spawner.
    #[inline]
    pub fn spawner(
        mut self,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn build(self) -> SchedulerResult<Scheduler> {
        let spawner: Arc<dyn WorkerSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(ThreadSpawner::new(self.config.stack_size)),
        };
        let timer = Timer::new(&format!("{}-timer", self.config.thread_name))?;
        let pool = WorkerPool::with_spawner(self.config, spawner, self.diagnostics.clone())?;
        Ok(Scheduler {
            pool,
            timer: Arc::new(timer),
            diagnostics: self.diagnostics,
            stats: Arc::new(SchedulerStats::default()),
        })
    }
}

/// Façade for submitting work and chaining futures.
///
/// Dropping the scheduler shuts the pool down after the queue drains.
pub struct Scheduler {
    pool: WorkerPool,
    timer: Arc<Timer>,
    diagnostics: Arc<dyn DiagnosticSink>,
    stats: Arc<SchedulerStats>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool", &self.pool.stats())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler with the default pool configuration.
    #[inline]
    pub fn new() -> SchedulerResult<Self> {
        Self::builder().build()
    }

    /// Create a scheduler with a custom pool configuration.
    #[inline]
    pub fn with_config(config: PoolConfig) -> SchedulerResult<Self> {
        Self::builder().pool(config).build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            config: PoolConfig::default(),
            diagnostics: Arc::new(TracingSink),
            spawner: None,
        }
    }

    /// Run `action` on the pool.
    ///
    /// A panic inside `action` faults the returned future.
    pub fn schedule<T, F>(
        &self,
        action: F,
    ) -> SchedulerResult<Future<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.schedule_with(TaskPriority::Normal, move |_| Step::Ready(action()))
    }

    /// Run a task body that may suspend, fault or observe cancellation.
    pub fn schedule_with<T, F>(
        &self,
        priority: TaskPriority,
        body: F,
    ) -> SchedulerResult<Future<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&TaskContext) -> Step<T> + Send + 'static,
    {
        let executor: Arc<dyn Executor> = Arc::new(self.pool.handle());
        self.submit(executor, priority, Box::new(body))
    }

    /// Run a task body on another executor, such as a [`LocalContext`].
    pub fn schedule_on<E, T, F>(
        &self,
        executor: E,
        priority: TaskPriority,
        body: F,
    ) -> SchedulerResult<Future<T>>
    where
        E: Executor + 'static,
        T: Clone + Send + 'static,
        F: FnOnce(&TaskContext) -> Step<T> + Send + 'static,
    {
        self.submit(Arc::new(executor), priority, Box::new(body))
    }

    fn submit<T>(
        &self,
        executor: Arc<dyn Executor>,
        priority: TaskPriority,
        body: Body<T>,
    ) -> SchedulerResult<Future<T>>
    where
        T: Clone + Send + 'static,
    {
        let future = Future::new(self.diagnostics.clone());
        let task = TaskCore {
            future: future.clone(),
            executor: executor.clone(),
            timer: self.timer.clone(),
            stats: self.stats.clone(),
        };
        let item = WorkItem::new(priority, move || drive(task, body));
        let id = item.id();
        executor.execute(item)?;

        self.stats.record_scheduled();
        debug!(task = %id, future = %future.id(), ?priority, "task scheduled");
        Ok(future)
    }

    /// Chain `f` after `future`: a new task that suspends on `future` and
    /// maps its outcome.
    pub fn then<T, U, F>(
        &self,
        future: &Future<T>,
        f: F,
    ) -> SchedulerResult<Future<U>>
    where
        T: Clone + Send + 'static,
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, AwaitError>) -> Step<U> + Send + 'static,
    {
        let awaited = future.clone();
        self.schedule_with(TaskPriority::Normal, move |cx| {
            cx.await_on(&awaited, move |result, _| f(result))
        })
    }

    /// A future of every value, in input order.
    ///
    /// Fails with the first fault (or cancellation) in input order.
    pub fn when_all<T>(
        &self,
        futures: Vec<Future<T>>,
    ) -> SchedulerResult<Future<Vec<T>>>
    where
        T: Clone + Send + 'static,
    {
        let remaining: VecDeque<Future<T>> = futures.into();
        let collected = Vec::with_capacity(remaining.len());
        self.schedule_with(TaskPriority::Normal, move |cx| {
            collect_all(cx, remaining, collected)
        })
    }

    /// Continuation target for "any worker of this pool".
    #[inline]
    pub fn any_worker(&self) -> ContinuationTarget {
        ContinuationTarget::executor(self.pool.handle())
    }

    /// Resize the pool. See [`WorkerPool::configure`].
    #[inline]
    pub fn configure(
        &self,
        min: usize,
        max: usize,
        idle_timeout: Duration,
    ) -> SchedulerResult<()> {
        self.pool.configure(min, max, idle_timeout)
    }

    #[inline]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[inline]
    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        !self.pool.is_shutdown()
    }

    /// Stop accepting work, drain the queue and stop the workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.timer.shutdown();
    }
}

fn collect_all<T>(
    cx: &TaskContext,
    mut remaining: VecDeque<Future<T>>,
    mut collected: Vec<T>,
) -> Step<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let Some(next) = remaining.pop_front() else {
        return Step::Ready(collected);
    };
    cx.await_on(&next, move |result, cx| match result {
        Ok(value) => {
            collected.push(value);
            collect_all(cx, remaining, collected)
        }
        Err(err) => err.into(),
    })
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
