//! Runtime errors

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Scheduler result
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised when submitting work or configuring the runtime.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The queue (or the pool owning it) has been shut down.
    #[error("Queue closed: no new work is accepted")]
    QueueClosed,

    /// A capacity-bounded queue is full.
    #[error("Queue full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The platform refused to start a worker thread.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SchedulerError {
    /// Whether the error is permanent for the current submission path.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SchedulerError::QueueFull { .. })
    }
}

/// How an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FaultKind {
    /// The action reported an error value.
    Error,
    /// The action panicked.
    Panic,
    /// A deadline elapsed while awaiting another operation.
    TimedOut,
}

/// The failure carried by a faulted future.
///
/// Cloned out to every awaiter and every continuation of the future.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct OperationFault {
    kind: FaultKind,
    message: Arc<str>,
}

impl OperationFault {
    /// Create a fault from an error message.
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            kind: FaultKind::Error,
            message: message.to_string().into(),
        }
    }

    /// Create a fault from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            kind: FaultKind::Panic,
            message: message.into(),
        }
    }

    /// Create a fault describing an elapsed await deadline.
    pub fn timed_out(after: Duration) -> Self {
        Self {
            kind: FaultKind::TimedOut,
            message: format!("await timed out after {:?}", after).into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What an awaiter observes when the awaited value is not available.
#[derive(Debug, Clone, Error)]
pub enum AwaitError {
    /// The awaited operation faulted; the fault is re-surfaced here.
    #[error("Awaited operation faulted: {0}")]
    Faulted(OperationFault),

    /// The awaited operation was canceled.
    #[error("Awaited operation was canceled")]
    Canceled,

    /// The waiter's own deadline elapsed. The awaited future is unaffected.
    #[error("Await timed out after {0:?}")]
    TimedOut(Duration),
}

/// Lock manager result
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised by the lock manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The key was never registered. Programmer error; never retried.
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Resource already registered: {0}")]
    DuplicateResource(String),

    /// The request could not be satisfied before its deadline.
    #[error("Lock acquisition timed out after {waited:?} ({attempts} attempts)")]
    Timeout { waited: Duration, attempts: u32 },
}

impl LockError {
    /// `Timeout` is retryable by the caller; everything else is fatal.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

/// Returned by a cancellation checkpoint once cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation canceled")]
pub struct Canceled;
