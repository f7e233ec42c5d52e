//! Runtime system
//!
//! The cooperative scheduler (work queue, worker pool, futures) and the
//! multi-resource lock manager.

pub mod diagnostics;
pub mod errors;
pub mod lock;
pub mod scheduler;

pub use diagnostics::{CollectingSink, DiagnosticEvent, DiagnosticSink, NullSink};
pub use errors::{
    AwaitError, Canceled, FaultKind, LockError, LockResult, OperationFault, SchedulerError,
    SchedulerResult,
};
pub use lock::{BackoffPolicy, LockHandle, LockManager, LockStats, LockStrategy};
pub use scheduler::{
    Future, FutureState, LocalContext, PoolConfig, Promise, Scheduler, Step, TaskContext,
    TaskPriority, WorkerPool,
};
