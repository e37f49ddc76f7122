//! Execution timer
//!
//! Measures host execution time between probes. The timer is paused as the
//! first action of probe entry and resumed as the last action of probe exit,
//! so recorded nanoseconds exclude tracer overhead. The caller charges each
//! pause's elapsed time to every thunk context on the stack.

use std::time::Instant;

#[derive(Debug, Default)]
pub struct ExecutionTimer {
    resumed_at: Option<Instant>,
}

impl ExecutionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the host-time measurement.
    pub fn resume(&mut self) {
        self.resumed_at = Some(Instant::now());
    }

    /// Stop the measurement and return nanoseconds elapsed since the last
    /// `resume`. Returns 0 if the timer was not running.
    pub fn pause(&mut self) -> u64 {
        match self.resumed_at.take() {
            Some(start) => start.elapsed().as_nanos() as u64,
            None => 0,
        }
    }
}
