//! Worker pool
//!
//! Owns a bounded, dynamically sized set of worker threads. Work submitted
//! while a worker is idle is handed to it directly; otherwise it goes through
//! the shared [`WorkQueue`] and a new worker is started if the pool is below
//! `max_workers`. Workers idle for longer than `idle_timeout` retire, never
//! taking the pool below `min_workers`.
//!
//! All pool bookkeeping goes through a single state object. Lock order is
//! always pool state first, then a worker's mailbox.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::context::Executor;
use super::queue::WorkQueue;
use super::task::WorkItem;
use crate::runtime::diagnostics::{DiagnosticEvent, DiagnosticSink};
use crate::runtime::errors::{OperationFault, SchedulerError, SchedulerResult};
use crate::util::config::duration_ms;

/// Identifier of a worker inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Pool sizing and back-pressure configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive even when idle.
    pub min_workers: usize,
    /// Upper bound on live workers.
    pub max_workers: usize,
    /// How long a surplus worker may stay idle before retiring.
    #[serde(with = "duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
    /// Queue depth above which a saturated pool reports `PoolSaturated`.
    pub saturation_threshold: usize,
    /// Optional bound on queued items.
    pub queue_capacity: Option<usize>,
    /// Prefix of worker thread names.
    pub thread_name: String,
    /// Worker stack size in bytes; platform default when unset.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            min_workers: 1,
            max_workers: num_cpus.max(2),
            idle_timeout: Duration::from_secs(10),
            saturation_threshold: 64,
            queue_capacity: None,
            thread_name: "taskweave-worker".to_string(),
            stack_size: None,
        }
    }
}

impl PoolConfig {
    /// Check the sizing invariants.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(SchedulerError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "idle_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Platform capability for starting a worker.
pub trait WorkerSpawner: Send + Sync {
    /// Run `body` on a new thread of execution named `name`.
    fn spawn(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send>,
    ) -> std::io::Result<()>;
}

/// Spawns OS threads through [`std::thread::Builder`].
#[derive(Debug, Clone, Default)]
pub struct ThreadSpawner {
    stack_size: Option<usize>,
}

impl ThreadSpawner {
    #[inline]
    pub fn new(stack_size: Option<usize>) -> Self {
        Self { stack_size }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send>,
    ) -> std::io::Result<()> {
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(body).map(|_| ())
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub spawned: u64,
    pub retired: u64,
    pub executed: u64,
    pub panicked: u64,
    pub peak_workers: usize,
}

impl PoolStats {
    #[inline]
    pub fn workers(&self) -> usize {
        self.idle + self.busy
    }
}

thread_local! {
    /// (pool id, worker id) of the worker running on this thread.
    static CURRENT_WORKER: Cell<Option<(u64, WorkerId)>> = const { Cell::new(None) };
}

static POOL_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
enum Mailbox {
    Empty,
    Item(WorkItem),
    Retire,
}

#[derive(Debug)]
struct WorkerSlot {
    id: WorkerId,
    mailbox: Mutex<Mailbox>,
    signal: Condvar,
}

impl WorkerSlot {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            mailbox: Mutex::new(Mailbox::Empty),
            signal: Condvar::new(),
        }
    }

    fn deliver(
        &self,
        message: Mailbox,
    ) {
        *self.mailbox.lock() = message;
        self.signal.notify_one();
    }
}

#[derive(Debug)]
struct PoolState {
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
    saturation_threshold: usize,
    /// Parked workers; the most recently parked is reused first.
    idle: Vec<Arc<WorkerSlot>>,
    /// Workers executing or about to look for work (includes ones starting up).
    busy: usize,
    saturated: bool,
    shutting_down: bool,
    next_worker: usize,
}

impl PoolState {
    #[inline]
    fn total(&self) -> usize {
        self.idle.len() + self.busy
    }
}

/// Lock-free counters readable without touching the pool state.
#[derive(Debug, Default)]
struct PoolCounters {
    idle: AtomicUsize,
    busy: AtomicUsize,
    spawned: AtomicU64,
    retired: AtomicU64,
    executed: AtomicU64,
    panicked: AtomicU64,
    peak: AtomicUsize,
}

impl PoolCounters {
    fn publish(
        &self,
        state: &PoolState,
    ) {
        self.idle.store(state.idle.len(), Ordering::Release);
        self.busy.store(state.busy, Ordering::Release);
        self.peak.fetch_max(state.total(), Ordering::Relaxed);
    }
}

struct PoolShared {
    id: u64,
    thread_name: String,
    queue: WorkQueue,
    state: Mutex<PoolState>,
    terminated: Condvar,
    counters: PoolCounters,
    spawner: Arc<dyn WorkerSpawner>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl std::fmt::Debug for PoolShared {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("id", &self.id)
            .field("queue", &self.queue.len())
            .finish()
    }
}

impl PoolShared {
    fn submit(
        self: &Arc<Self>,
        item: WorkItem,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(SchedulerError::QueueClosed);
        }

        if let Some(slot) = state.idle.pop() {
            state.busy += 1;
            self.counters.publish(&state);
            trace!(worker = %slot.id, task = %item.id(), "hand-off to idle worker");
            slot.deliver(Mailbox::Item(item));
            return Ok(());
        }

        self.queue.enqueue(item)?;

        if state.total() < state.max_workers {
            let slot = self.reserve_worker(&mut state);
            drop(state);
            if let Err(err) = self.start_worker(slot) {
                // The item stays queued; it only fails if nobody can ever run it.
                if self.state.lock().total() == 0 {
                    return Err(err);
                }
            }
            return Ok(());
        }

        let depth = self.queue.len();
        if !state.saturated && state.busy >= state.max_workers && depth > state.saturation_threshold {
            state.saturated = true;
            let event = DiagnosticEvent::PoolSaturated {
                busy: state.busy,
                max_workers: state.max_workers,
                queue_depth: depth,
                threshold: state.saturation_threshold,
            };
            drop(state);
            self.diagnostics.emit(event);
        }
        Ok(())
    }

    /// Account for a new worker before its thread exists.
    fn reserve_worker(
        &self,
        state: &mut PoolState,
    ) -> Arc<WorkerSlot> {
        let id = WorkerId(state.next_worker);
        state.next_worker += 1;
        state.busy += 1;
        self.counters.publish(state);
        Arc::new(WorkerSlot::new(id))
    }

    fn start_worker(
        self: &Arc<Self>,
        slot: Arc<WorkerSlot>,
    ) -> SchedulerResult<()> {
        let id = slot.id;
        let shared = self.clone();
        let name = format!("{}-{}", self.thread_name, id.0);
        match self
            .spawner
            .spawn(name, Box::new(move || shared.worker_main(slot)))
        {
            Ok(()) => {
                self.counters.spawned.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %id, "worker spawned");
                Ok(())
            }
            Err(err) => {
                warn!(worker = %id, error = %err, "failed to spawn worker");
                let mut state = self.state.lock();
                state.busy -= 1;
                self.counters.publish(&state);
                if state.total() == 0 {
                    self.terminated.notify_all();
                }
                Err(SchedulerError::Spawn(err))
            }
        }
    }

    fn worker_main(
        self: Arc<Self>,
        slot: Arc<WorkerSlot>,
    ) {
        CURRENT_WORKER.with(|current| current.set(Some((self.id, slot.id))));

        while let Some(item) = self.next_item(&slot) {
            self.execute(item);
        }

        CURRENT_WORKER.with(|current| current.set(None));
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        debug!(worker = %slot.id, "worker retired");

        let _state = self.state.lock();
        self.terminated.notify_all();
    }

    fn execute(
        &self,
        item: WorkItem,
    ) {
        let task = item.id();
        let waited = item.enqueue_time().elapsed();
        trace!(task = %task, ?waited, "executing work item");

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.run())) {
            self.counters.panicked.fetch_add(1, Ordering::Relaxed);
            let fault = OperationFault::from_panic(payload);
            error!(task = %task, fault = %fault, "work item panicked");
        }
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Block until this worker has something to run. `None` means retire.
    fn next_item(
        &self,
        slot: &Arc<WorkerSlot>,
    ) -> Option<WorkItem> {
        let idle_timeout = {
            let mut state = self.state.lock();
            if let Some(item) = self.queue.try_dequeue() {
                if state.saturated && self.queue.len() <= state.saturation_threshold {
                    state.saturated = false;
                }
                return Some(item);
            }

            state.busy -= 1;
            if state.shutting_down || state.total() >= state.max_workers {
                // The pool shrank below our head count, or is going away.
                self.counters.publish(&state);
                return None;
            }
            state.idle.push(slot.clone());
            self.counters.publish(&state);
            state.idle_timeout
        };

        let mut deadline = Instant::now() + idle_timeout;
        loop {
            {
                let mut mailbox = slot.mailbox.lock();
                loop {
                    match std::mem::replace(&mut *mailbox, Mailbox::Empty) {
                        Mailbox::Item(item) => return Some(item),
                        Mailbox::Retire => return None,
                        Mailbox::Empty => {}
                    }
                    if slot.signal.wait_until(&mut mailbox, deadline).timed_out() {
                        break;
                    }
                }
            }

            let mut state = self.state.lock();
            let mut mailbox = slot.mailbox.lock();
            match std::mem::replace(&mut *mailbox, Mailbox::Empty) {
                Mailbox::Item(item) => return Some(item),
                Mailbox::Retire => return None,
                Mailbox::Empty => {}
            }
            if state.total() > state.min_workers {
                if let Some(pos) = state.idle.iter().position(|s| Arc::ptr_eq(s, slot)) {
                    state.idle.remove(pos);
                    self.counters.publish(&state);
                    trace!(worker = %slot.id, "idle timeout");
                    return None;
                }
            }
            deadline = Instant::now() + state.idle_timeout;
        }
    }

    /// Tell one parked worker to exit. Caller holds the state lock.
    fn retire_idle(
        &self,
        state: &mut PoolState,
    ) -> bool {
        match state.idle.pop() {
            Some(slot) => {
                slot.deliver(Mailbox::Retire);
                self.counters.publish(state);
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> PoolStats {
        let (min_workers, max_workers) = {
            let state = self.state.lock();
            (state.min_workers, state.max_workers)
        };
        PoolStats {
            min_workers,
            max_workers,
            idle: self.counters.idle.load(Ordering::Acquire),
            busy: self.counters.busy.load(Ordering::Acquire),
            queued: self.queue.len(),
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            peak_workers: self.counters.peak.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable submission handle to a [`WorkerPool`].
///
/// Holding a handle does not keep the pool running.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    #[inline]
    pub fn submit(
        &self,
        item: WorkItem,
    ) -> SchedulerResult<()> {
        self.shared.submit(item)
    }

    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl Executor for PoolHandle {
    fn execute(
        &self,
        item: WorkItem,
    ) -> SchedulerResult<()> {
        self.shared.submit(item)
    }

    fn is_current(&self) -> bool {
        CURRENT_WORKER.with(|current| matches!(current.get(), Some((id, _)) if id == self.shared.id))
    }
}

/// Bounded, dynamically sized pool of workers.
///
/// Dropping the pool shuts it down.
#[derive(Debug)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool with OS-thread workers.
    pub fn new(
        config: PoolConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> SchedulerResult<Self> {
        let spawner = Arc::new(ThreadSpawner::new(config.stack_size));
        Self::with_spawner(config, spawner, diagnostics)
    }

    /// Create a pool whose workers are started by `spawner`.
    ///
    /// `min_workers` workers are started immediately.
    pub fn with_spawner(
        config: PoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> SchedulerResult<Self> {
        config.validate()?;

        let queue = match config.queue_capacity {
            Some(capacity) => WorkQueue::with_capacity(capacity),
            None => WorkQueue::new(),
        };
        let shared = Arc::new(PoolShared {
            id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
            thread_name: config.thread_name.clone(),
            queue,
            state: Mutex::new(PoolState {
                min_workers: config.min_workers,
                max_workers: config.max_workers,
                idle_timeout: config.idle_timeout,
                saturation_threshold: config.saturation_threshold,
                idle: Vec::with_capacity(config.max_workers),
                busy: 0,
                saturated: false,
                shutting_down: false,
                next_worker: 0,
            }),
            terminated: Condvar::new(),
            counters: PoolCounters::default(),
            spawner,
            diagnostics,
        });

        let pool = Self { shared };
        for _ in 0..config.min_workers {
            pool.spawn_worker()?;
        }
        debug!(
            min = config.min_workers,
            max = config.max_workers,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Submit a work item.
    ///
    /// Fails with `QueueClosed` after shutdown. A failed worker spawn is only
    /// reported when the pool has no worker at all; the item then stays
    /// queued until one starts.
    #[inline]
    pub fn submit(
        &self,
        item: WorkItem,
    ) -> SchedulerResult<()> {
        self.shared.submit(item)
    }

    /// Start one more worker if the pool is below `max_workers`.
    ///
    /// Returns whether a worker was started.
    pub fn spawn_worker(&self) -> SchedulerResult<bool> {
        let slot = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(SchedulerError::QueueClosed);
            }
            if state.total() >= state.max_workers {
                return Ok(false);
            }
            self.shared.reserve_worker(&mut state)
        };
        self.shared.start_worker(slot)?;
        Ok(true)
    }

    /// Retire one idle worker if the pool is above `min_workers`.
    ///
    /// Returns whether a worker was asked to exit.
    pub fn retire_worker(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.total() <= state.min_workers {
            return false;
        }
        self.shared.retire_idle(&mut state)
    }

    /// Change the pool bounds.
    ///
    /// Missing workers up to `min` are started right away. Surplus idle
    /// workers exit immediately; surplus busy workers exit after their
    /// current item. Parked workers apply a new idle timeout after their
    /// current wait.
    pub fn configure(
        &self,
        min: usize,
        max: usize,
        idle_timeout: Duration,
    ) -> SchedulerResult<()> {
        let check = PoolConfig {
            min_workers: min,
            max_workers: max,
            idle_timeout,
            ..PoolConfig::default()
        };
        check.validate()?;

        let missing = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(SchedulerError::QueueClosed);
            }
            state.min_workers = min;
            state.max_workers = max;
            state.idle_timeout = idle_timeout;
            while state.total() > max && self.shared.retire_idle(&mut state) {}
            min.saturating_sub(state.total())
        };

        debug!(min, max, ?idle_timeout, "worker pool reconfigured");
        for _ in 0..missing {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Update the queue depth that triggers `PoolSaturated`.
    pub fn set_saturation_threshold(
        &self,
        threshold: usize,
    ) {
        self.shared.state.lock().saturation_threshold = threshold;
    }

    /// Cloneable handle for submitting work.
    #[inline]
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    /// Snapshot of the pool counters.
    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Id of the pool worker running the calling thread, if any.
    pub fn current_worker(&self) -> Option<WorkerId> {
        CURRENT_WORKER.with(|current| match current.get() {
            Some((pool, worker)) if pool == self.shared.id => Some(worker),
            _ => None,
        })
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Stop accepting work, let workers drain the queue, and wait for them
    /// to exit.
    ///
    /// Called from one of the pool's own workers, this does not wait.
    pub fn shutdown(&self) {
        self.begin_shutdown();
        if self.current_worker().is_none() {
            let mut state = self.shared.state.lock();
            while state.total() > 0 {
                self.shared.terminated.wait(&mut state);
            }
        }
    }

    /// Like [`WorkerPool::shutdown`] with a bound on the wait.
    ///
    /// Returns whether every worker exited in time.
    pub fn shutdown_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        self.begin_shutdown();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        let own = usize::from(self.current_worker().is_some());
        while state.total() > own {
            if self
                .shared
                .terminated
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.total() <= own;
            }
        }
        true
    }

    fn begin_shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        self.shared.queue.close();
        while self.shared.retire_idle(&mut state) {}
        debug!(busy = state.busy, "worker pool shutting down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
