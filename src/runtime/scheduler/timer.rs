//! Deadline timer
//!
//! A single background thread that runs callbacks at their deadlines. Used
//! for await deadlines; callbacks are expected to be short (they normally
//! just submit a work item).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

struct Entry {
    deadline: Instant,
    seq: u64,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest deadline first.
    fn cmp(
        &self,
        other: &Self,
    ) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Background deadline timer.
pub struct Timer {
    sender: Mutex<Option<Sender<Entry>>>,
    seq: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl std::fmt::Debug for Timer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("thread_id", &self.thread_id)
            .field("running", &self.sender.lock().is_some())
            .finish()
    }
}

impl Timer {
    /// Start the timer thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Entry>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
                loop {
                    let received = match heap.peek() {
                        Some(next) => receiver.recv_deadline(next.deadline),
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match received {
                        Ok(entry) => heap.push(entry),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let now = Instant::now();
                    while heap.peek().is_some_and(|next| next.deadline <= now) {
                        if let Some(entry) = heap.pop() {
                            fire(entry);
                        }
                    }
                }

                // Elapse the rest early rather than leave their waiters hanging.
                debug!(pending = heap.len(), "timer stopping");
                while let Some(entry) = heap.pop() {
                    fire(entry);
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            seq: AtomicU64::new(0),
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `callback` on the timer thread at `deadline`.
    ///
    /// Returns `false` if the timer is stopped; the callback then runs
    /// immediately on the calling thread.
    pub fn schedule_at<F>(
        &self,
        deadline: Instant,
        callback: F,
    ) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            deadline,
            seq,
            callback: Box::new(callback),
        };

        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => match sender.send(entry) {
                Ok(()) => return true,
                Err(err) => err.into_inner(),
            },
            None => entry,
        };
        fire(rejected);
        false
    }

    /// Run `callback` on the timer thread after `delay`.
    #[inline]
    pub fn schedule_after<F>(
        &self,
        delay: Duration,
        callback: F,
    ) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, callback)
    }

    /// Stop the timer. Pending callbacks fire immediately.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fire(entry: Entry) {
    if panic::catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
        error!(seq = entry.seq, "timer callback panicked");
    }
}
