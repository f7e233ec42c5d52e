//! taskweave
//!
//! A cooperative task-scheduling runtime: priority work queue, elastic
//! worker pool, futures with explicit suspension, and a deadlock-free
//! multi-resource lock manager.
//!
//! # Example
//!
//! ```no_run
//! use taskweave::Scheduler;
//!
//! let scheduler = Scheduler::new().unwrap();
//! let answer = scheduler.schedule(|| 21 * 2).unwrap();
//! assert_eq!(answer.wait().unwrap(), 42);
//! ```
//!
//! # Crate Features
//!
//! - `debug`: extra tracing around continuation dispatch

#![doc(html_root_url = "https://docs.rs/taskweave")]
#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::{
    AwaitError, Future, LockError, LockHandle, LockManager, LockStrategy, OperationFault, Promise,
    Scheduler, SchedulerError, Step, TaskContext, TaskPriority,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "taskweave";
