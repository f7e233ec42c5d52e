//! Diagnostic events
//!
//! The runtime reports advisory conditions as structured [`DiagnosticEvent`]
//! values handed to a [`DiagnosticSink`]. Formatting and output belong to the
//! sink; see `util::logger::TracingSink` for the default one.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use super::errors::OperationFault;
use super::scheduler::FutureId;

/// An advisory event emitted by the runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum DiagnosticEvent {
    /// Every worker is busy and the queue is deeper than the configured threshold.
    PoolSaturated {
        busy: usize,
        max_workers: usize,
        queue_depth: usize,
        threshold: usize,
    },
    /// A faulted future was dropped without anyone observing the fault.
    UnobservedFault {
        future_id: FutureId,
        #[serde(serialize_with = "serialize_fault")]
        fault: OperationFault,
    },
}

fn serialize_fault<S: serde::Serializer>(
    fault: &OperationFault,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;

    let mut state = serializer.serialize_struct("OperationFault", 2)?;
    state.serialize_field("kind", &fault.kind())?;
    state.serialize_field("message", fault.message())?;
    state.end()
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(
        &self,
        event: DiagnosticEvent,
    );
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(
        &self,
        _event: DiagnosticEvent,
    ) {
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl CollectingSink {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    /// Remove and return the events received so far.
    pub fn take(&self) -> Vec<DiagnosticEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn unobserved_faults(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DiagnosticEvent::UnobservedFault { .. }))
            .count()
    }

    pub fn saturation_events(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DiagnosticEvent::PoolSaturated { .. }))
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(
        &self,
        event: DiagnosticEvent,
    ) {
        self.events.lock().push(event);
    }
}

static DEFAULT_SINK: Lazy<Arc<dyn DiagnosticSink>> =
    Lazy::new(|| Arc::new(crate::util::logger::TracingSink));

/// The process-wide sink used by futures created outside a scheduler.
#[inline]
pub fn default_sink() -> Arc<dyn DiagnosticSink> {
    DEFAULT_SINK.clone()
}
