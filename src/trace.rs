//! Structured events for observing combiner behavior.
//!
//! Tracing is best-effort and has no bearing on combiner correctness. Event
//! construction is deferred: nothing is built unless a sink is registered.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lazy_static::lazy_static;

/// One structured record of combiner activity.
///
/// `combiner` is the address of the combiner concerned, matching
/// [`crate::Combiner::id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// A combiner was created.
    CombinerCreate {
        /// Subject combiner.
        combiner: usize,
    },
    /// A combiner freed itself.
    CombinerDestroy {
        /// Subject combiner.
        combiner: usize,
    },
    /// A closure was submitted via `run`.
    Submit {
        /// Subject combiner.
        combiner: usize,
    },
    /// A queued closure was popped for execution.
    Pop {
        /// Subject combiner.
        combiner: usize,
    },
    /// Remaining work was handed to the worker pool.
    Offload {
        /// Subject combiner.
        combiner: usize,
    },
    /// A drain round started executing the final list.
    FinalPhaseStart {
        /// Subject combiner.
        combiner: usize,
    },
    /// A handle was taken or released.
    RefCountDelta {
        /// Subject combiner.
        combiner: usize,
        /// +1 for a clone, -1 for a drop.
        delta: isize,
        /// Handle count after the change.
        refs: usize,
    },
}

impl TraceEvent {
    /// The combiner this event concerns.
    pub fn combiner(&self) -> usize {
        match *self {
            TraceEvent::CombinerCreate { combiner }
            | TraceEvent::CombinerDestroy { combiner }
            | TraceEvent::Submit { combiner }
            | TraceEvent::Pop { combiner }
            | TraceEvent::Offload { combiner }
            | TraceEvent::FinalPhaseStart { combiner }
            | TraceEvent::RefCountDelta { combiner, .. } => combiner,
        }
    }
}

/// Best-effort consumer of trace events.
pub trait TraceSink: Send + Sync {
    /// Consume one event. `build` produces the record and is called at most
    /// once.
    fn append(&self, build: &dyn Fn() -> TraceEvent);
}

lazy_static! {
    static ref SINK: RwLock<Option<Arc<dyn TraceSink>>> = RwLock::new(None);
}

fn sink_read() -> RwLockReadGuard<'static, Option<Arc<dyn TraceSink>>> {
    match SINK.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn sink_write() -> RwLockWriteGuard<'static, Option<Arc<dyn TraceSink>>> {
    match SINK.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Route combiner events to `sink` until [`clear_trace_sink`] is called or a
/// different sink replaces it. Process-wide.
pub fn register_trace_sink(sink: Arc<dyn TraceSink>) {
    *sink_write() = Some(sink);
}

/// Disable tracing.
pub fn clear_trace_sink() {
    *sink_write() = None;
}

pub(crate) fn emit<F: Fn() -> TraceEvent>(build: F) {
    if let Some(sink) = sink_read().as_ref() {
        sink.append(&build);
    }
}
