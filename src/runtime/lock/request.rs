//! Resources and in-flight lock requests.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::Arc;

/// Arena index of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId(pub usize);

/// Identity of one `acquire_all` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequesterId(pub u64);

impl std::fmt::Display for RequesterId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Requester({})", self.0)
    }
}

/// A protected resource. Its mutual exclusion never leaves this module's
/// callers: only the lock manager touches `holder`.
#[derive(Debug)]
pub(crate) struct Resource<K> {
    pub(crate) id: ResourceId,
    pub(crate) key: K,
    pub(crate) rank: u64,
    holder: Mutex<Option<RequesterId>>,
    released: Condvar,
}

impl<K> Resource<K> {
    pub(crate) fn new(
        id: ResourceId,
        key: K,
        rank: u64,
    ) -> Self {
        Self {
            id,
            key,
            rank,
            holder: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Position in the global acquisition order.
    #[inline]
    pub(crate) fn order(&self) -> (u64, ResourceId) {
        (self.rank, self.id)
    }

    pub(crate) fn holder(&self) -> Option<RequesterId> {
        *self.holder.lock()
    }

    /// Wait for the resource, up to `deadline` if given.
    ///
    /// Returns whether it was acquired.
    fn acquire(
        &self,
        requester: RequesterId,
        deadline: Option<Instant>,
    ) -> bool {
        let mut holder = self.holder.lock();
        while holder.is_some() {
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut holder, deadline).timed_out()
                        && holder.is_some()
                    {
                        return false;
                    }
                }
                None => self.released.wait(&mut holder),
            }
        }
        *holder = Some(requester);
        true
    }

    fn release(
        &self,
        requester: RequesterId,
    ) {
        let mut holder = self.holder.lock();
        debug_assert_eq!(*holder, Some(requester), "resource released by a non-holder");
        if *holder == Some(requester) {
            *holder = None;
        }
        drop(holder);
        self.released.notify_all();
    }
}

/// One request for simultaneous access to a set of resources.
///
/// `resources` is in acquisition order; the first `acquired` of them are held.
#[derive(Debug)]
pub(crate) struct LockRequest<K> {
    pub(crate) requester: RequesterId,
    pub(crate) resources: SmallVec<[Arc<Resource<K>>; 4]>,
    pub(crate) acquired: usize,
    pub(crate) deadline: Option<Instant>,
}

impl<K> LockRequest<K> {
    pub(crate) fn new(
        requester: RequesterId,
        resources: SmallVec<[Arc<Resource<K>>; 4]>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            requester,
            resources,
            acquired: 0,
            deadline,
        }
    }

    /// Acquire the next resource, waiting until `limit` (or forever).
    pub(crate) fn acquire_next(
        &mut self,
        limit: Option<Instant>,
    ) -> bool {
        let resource = &self.resources[self.acquired];
        if resource.acquire(self.requester, limit) {
            self.acquired += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.acquired == self.resources.len()
    }

    /// Release everything acquired so far, newest first.
    pub(crate) fn release_all(&mut self) {
        while self.acquired > 0 {
            self.acquired -= 1;
            self.resources[self.acquired].release(self.requester);
        }
    }
}
