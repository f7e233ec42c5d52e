//! Multi-resource lock manager
//!
//! Callers ask for a whole set of keyed resources at once and get back a
//! [`LockHandle`] that releases all of them on drop. Two strategies keep
//! competing requests from deadlocking:
//!
//! - [`LockStrategy::Ordered`]: every request takes its resources in one
//!   global order (rank, then registration sequence) and blocks on each in
//!   turn. No cycle of waiters can form.
//! - [`LockStrategy::Backoff`]: resources are taken in request order, each
//!   with a bounded wait. On a miss everything held is released and the
//!   request retries after a randomized exponential delay.

mod backoff;
mod request;

#[cfg(test)]
mod tests;

pub use backoff::BackoffPolicy;
pub use request::{RequesterId, ResourceId};

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::runtime::errors::{LockError, LockResult};
use crate::util::config::LockConfig;
use request::{LockRequest, Resource};

static NEXT_MANAGER: AtomicU64 = AtomicU64::new(1);

/// Deadlock-avoidance strategy of a [`LockManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockStrategy {
    /// Acquire in global rank order, blocking on each resource.
    Ordered,
    /// Acquire in request order with per-resource timeouts and retries.
    Backoff(BackoffPolicy),
}

impl Default for LockStrategy {
    fn default() -> Self {
        LockStrategy::Ordered
    }
}

impl LockStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LockStrategy::Ordered => "ordered",
            LockStrategy::Backoff(_) => "backoff",
        }
    }
}

/// Lock manager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub resources: usize,
    pub acquisitions: u64,
    pub releases: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub unknown_resources: u64,
    pub total_wait_us: u64,
}

#[derive(Debug, Default)]
struct LockCounters {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    unknown_resources: AtomicU64,
    total_wait_us: AtomicU64,
}

struct Registry<K> {
    index: IndexMap<K, ResourceId>,
    resources: Vec<Arc<Resource<K>>>,
}

struct ManagerInner<K> {
    id: u64,
    strategy: LockStrategy,
    default_timeout: Option<Duration>,
    registry: RwLock<Registry<K>>,
    next_requester: AtomicU64,
    counters: LockCounters,
}

/// Grants exclusive access to sets of registered resources.
///
/// Cloning is cheap and shares the registry.
pub struct LockManager<K> {
    inner: Arc<ManagerInner<K>>,
}

impl<K> Clone for LockManager<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> fmt::Debug for LockManager<K> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("strategy", &self.inner.strategy)
            .field("resources", &self.inner.registry.read().resources.len())
            .finish()
    }
}

impl<K> LockManager<K>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(strategy: LockStrategy) -> Self {
        Self::with_default_timeout(strategy, None)
    }

    /// Manager using [`LockStrategy::Ordered`].
    pub fn ordered() -> Self {
        Self::new(LockStrategy::Ordered)
    }

    /// Manager using [`LockStrategy::Backoff`].
    pub fn with_backoff(policy: BackoffPolicy) -> Self {
        Self::new(LockStrategy::Backoff(policy))
    }

    /// `default_timeout` bounds every [`LockManager::acquire_all`] call.
    pub fn with_default_timeout(
        strategy: LockStrategy,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                id: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
                strategy,
                default_timeout,
                registry: RwLock::new(Registry {
                    index: IndexMap::new(),
                    resources: Vec::new(),
                }),
                next_requester: AtomicU64::new(1),
                counters: LockCounters::default(),
            }),
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::with_default_timeout(config.strategy(), config.default_timeout)
    }

    #[inline]
    pub fn strategy(&self) -> LockStrategy {
        self.inner.strategy
    }

    /// Register `key`, ranked after every resource registered so far.
    pub fn register(
        &self,
        key: K,
    ) -> LockResult<ResourceId> {
        let mut registry = self.inner.registry.write();
        let rank = registry.resources.len() as u64;
        Self::insert(&mut registry, key, rank)
    }

    /// Register `key` with an explicit rank. Equal ranks are ordered by
    /// registration sequence.
    pub fn register_with_rank(
        &self,
        key: K,
        rank: u64,
    ) -> LockResult<ResourceId> {
        let mut registry = self.inner.registry.write();
        Self::insert(&mut registry, key, rank)
    }

    fn insert(
        registry: &mut Registry<K>,
        key: K,
        rank: u64,
    ) -> LockResult<ResourceId> {
        if registry.index.contains_key(&key) {
            return Err(LockError::DuplicateResource(format!("{:?}", key)));
        }
        let id = ResourceId(registry.resources.len());
        registry
            .resources
            .push(Arc::new(Resource::new(id, key.clone(), rank)));
        registry.index.insert(key, id);
        Ok(id)
    }

    pub fn contains(
        &self,
        key: &K,
    ) -> bool {
        self.inner.registry.read().index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.registry.read().index.keys().cloned().collect()
    }

    /// Current holder of `key`. A snapshot; it may change right away.
    pub fn holder(
        &self,
        key: &K,
    ) -> LockResult<Option<RequesterId>> {
        let registry = self.inner.registry.read();
        match registry.index.get(key) {
            Some(id) => Ok(registry.resources[id.0].holder()),
            None => Err(LockError::UnknownResource(format!("{:?}", key))),
        }
    }

    pub fn is_held(
        &self,
        key: &K,
    ) -> LockResult<bool> {
        Ok(self.holder(key)?.is_some())
    }

    /// Acquire every resource in `keys`, bounded by the default timeout.
    ///
    /// Duplicate keys are ignored. An unregistered key fails before anything
    /// is acquired.
    pub fn acquire_all(
        &self,
        keys: &[K],
    ) -> LockResult<LockHandle<K>> {
        self.acquire(keys, self.inner.default_timeout)
    }

    /// Acquire every resource in `keys` within `timeout`.
    ///
    /// On [`LockError::Timeout`] nothing is held.
    pub fn acquire_all_timeout(
        &self,
        keys: &[K],
        timeout: Duration,
    ) -> LockResult<LockHandle<K>> {
        self.acquire(keys, Some(timeout))
    }

    /// Run `f` with every resource in `keys` held, releasing them afterwards
    /// even if `f` panics.
    pub fn with_locks<R>(
        &self,
        keys: &[K],
        f: impl FnOnce(&LockHandle<K>) -> R,
    ) -> LockResult<R> {
        let handle = self.acquire_all(keys)?;
        Ok(f(&handle))
    }

    pub fn stats(&self) -> LockStats {
        let c = &self.inner.counters;
        LockStats {
            resources: self.len(),
            acquisitions: c.acquisitions.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            unknown_resources: c.unknown_resources.load(Ordering::Relaxed),
            total_wait_us: c.total_wait_us.load(Ordering::Relaxed),
        }
    }

    fn acquire(
        &self,
        keys: &[K],
        timeout: Option<Duration>,
    ) -> LockResult<LockHandle<K>> {
        let started = Instant::now();
        let requester = RequesterId(self.inner.next_requester.fetch_add(1, Ordering::Relaxed));
        let mut resources = self.resolve(keys)?;
        if self.inner.strategy == LockStrategy::Ordered {
            resources.sort_by_key(|r| r.order());
        }

        let deadline = timeout.map(|t| started + t);
        let mut request = LockRequest::new(requester, resources, deadline);
        trace!(%requester, keys = ?keys, strategy = self.inner.strategy.name(), "acquiring");

        let acquired = match self.inner.strategy {
            LockStrategy::Ordered => self.acquire_ordered(&mut request),
            LockStrategy::Backoff(policy) => self.acquire_backoff(&mut request, &policy),
        };

        let waited = started.elapsed();
        let counters = &self.inner.counters;
        counters
            .total_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        match acquired {
            Ok(()) => {
                counters.acquisitions.fetch_add(1, Ordering::Relaxed);
                Ok(LockHandle::new(self.inner.clone(), request))
            }
            Err(attempts) => {
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(%requester, ?waited, attempts, "lock acquisition timed out");
                Err(LockError::Timeout { waited, attempts })
            }
        }
    }

    /// Map keys to resources, dropping duplicates but keeping first-seen order.
    fn resolve(
        &self,
        keys: &[K],
    ) -> LockResult<SmallVec<[Arc<Resource<K>>; 4]>> {
        let registry = self.inner.registry.read();
        let mut resources: SmallVec<[Arc<Resource<K>>; 4]> = SmallVec::with_capacity(keys.len());
        for key in keys {
            let Some(id) = registry.index.get(key) else {
                self.inner
                    .counters
                    .unknown_resources
                    .fetch_add(1, Ordering::Relaxed);
                return Err(LockError::UnknownResource(format!("{:?}", key)));
            };
            if !resources.iter().any(|r| r.id == *id) {
                resources.push(registry.resources[id.0].clone());
            }
        }
        Ok(resources)
    }

    /// Strategy A. Errs with the attempt count on deadline.
    fn acquire_ordered(
        &self,
        request: &mut LockRequest<K>,
    ) -> Result<(), u32> {
        if let Some(first) = request.resources.first() {
            lock_order::check(self.inner.id, first.order());
        }
        while !request.is_complete() {
            if !request.acquire_next(request.deadline) {
                request.release_all();
                return Err(1);
            }
        }
        Ok(())
    }

    /// Strategy B. Errs with the attempt count on deadline.
    fn acquire_backoff(
        &self,
        request: &mut LockRequest<K>,
        policy: &BackoffPolicy,
    ) -> Result<(), u32> {
        let mut rng = rand::rng();
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            let mut missed = false;
            while !request.is_complete() {
                let mut limit = Instant::now() + policy.per_resource_timeout;
                if let Some(deadline) = request.deadline {
                    limit = limit.min(deadline);
                }
                if !request.acquire_next(Some(limit)) {
                    missed = true;
                    break;
                }
            }
            if !missed {
                return Ok(());
            }

            request.release_all();
            self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);

            let mut delay = policy.delay(attempts, &mut rng);
            if let Some(deadline) = request.deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(attempts);
                }
                delay = delay.min(deadline - now);
            }
            trace!(requester = %request.requester, attempts, ?delay, "backing off");
            std::thread::sleep(delay);
        }
    }
}

/// Exclusive access to a set of resources, released on drop.
///
/// Handles stay on the thread that acquired them.
pub struct LockHandle<K> {
    manager: Arc<ManagerInner<K>>,
    request: LockRequest<K>,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl<K> LockHandle<K> {
    fn new(
        manager: Arc<ManagerInner<K>>,
        request: LockRequest<K>,
    ) -> Self {
        if manager.strategy == LockStrategy::Ordered {
            for resource in &request.resources {
                lock_order::push(manager.id, resource.order());
            }
        }
        Self {
            manager,
            request,
            released: false,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn requester(&self) -> RequesterId {
        self.request.requester
    }

    /// Held resources in acquisition order.
    pub fn resources(&self) -> Vec<ResourceId> {
        self.request.resources.iter().map(|r| r.id).collect()
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release every resource. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.manager.strategy == LockStrategy::Ordered {
            for resource in &self.request.resources {
                lock_order::pop(self.manager.id, resource.order());
            }
        }
        self.request.release_all();
        self.manager.counters.releases.fetch_add(1, Ordering::Relaxed);
    }
}

impl<K: Clone> LockHandle<K> {
    /// Held keys in acquisition order.
    pub fn keys(&self) -> Vec<K> {
        self.request.resources.iter().map(|r| r.key.clone()).collect()
    }
}

impl<K> fmt::Debug for LockHandle<K> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("requester", &self.request.requester)
            .field("resources", &self.resources())
            .field("released", &self.released)
            .finish()
    }
}

impl<K> Drop for LockHandle<K> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Debug-build check that a thread holding ordered locks only asks for
/// resources ranked after them.
#[cfg(debug_assertions)]
mod lock_order {
    use std::cell::RefCell;

    use super::ResourceId;

    type Order = (u64, ResourceId);

    thread_local! {
        static HELD: RefCell<Vec<(u64, Order)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn check(
        manager: u64,
        next: Order,
    ) {
        HELD.with(|held| {
            let held = held.borrow();
            if let Some((_, last)) = held
                .iter()
                .filter(|(m, _)| *m == manager)
                .max_by_key(|(_, order)| *order)
            {
                assert!(
                    *last < next,
                    "lock order violation: acquiring {:?} while holding {:?}",
                    next,
                    last
                );
            }
        });
    }

    pub(super) fn push(
        manager: u64,
        order: Order,
    ) {
        HELD.with(|held| held.borrow_mut().push((manager, order)));
    }

    pub(super) fn pop(
        manager: u64,
        order: Order,
    ) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|entry| *entry == (manager, order)) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(not(debug_assertions))]
mod lock_order {
    use super::ResourceId;

    #[inline(always)]
    pub(super) fn check(
        _manager: u64,
        _next: (u64, ResourceId),
    ) {
    }

    #[inline(always)]
    pub(super) fn push(
        _manager: u64,
        _order: (u64, ResourceId),
    ) {
    }

    #[inline(always)]
    pub(super) fn pop(
        _manager: u64,
        _order: (u64, ResourceId),
    ) {
    }
}
