//! Helpers for exercising combiners in tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::trace::{register_trace_sink, TraceEvent, TraceSink};

/// Trace sink that records every event in memory.
///
/// The sink registry is process-wide, so tests that install a recorder
/// should not run in parallel with other trace-sensitive tests; filter by
/// combiner id to ignore stray events from unrelated combiners.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<TraceEvent>>,
}

impl Recorder {
    /// Create a recorder and register it as the process trace sink.
    pub fn install() -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        register_trace_sink(Arc::clone(&recorder) as Arc<dyn TraceSink>);
        recorder
    }

    fn events(&self) -> MutexGuard<'_, Vec<TraceEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Events recorded so far for the given combiner, in arrival order.
    pub fn events_for(&self, combiner: usize) -> Vec<TraceEvent> {
        self.events()
            .iter()
            .filter(|event| event.combiner() == combiner)
            .copied()
            .collect()
    }

    /// How many recorded events for `combiner` satisfy `pred`.
    pub fn count<F: Fn(&TraceEvent) -> bool>(&self, combiner: usize, pred: F) -> usize {
        self.events_for(combiner)
            .into_iter()
            .filter(|e| pred(e))
            .count()
    }
}

impl TraceSink for Recorder {
    fn append(&self, build: &dyn Fn() -> TraceEvent) {
        self.events().push(build());
    }
}

/// Spin until `cond` holds, failing the test after five seconds.
pub fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let backoff = Backoff::new();
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        backoff.snooze();
    }
}
