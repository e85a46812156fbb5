//! Wall-clock accounting, shared along a transformation chain.

use std::time::Instant;

use serde::Serialize;

/// Cumulated wall-clock times, in seconds. A source model and the models
/// derived from it share one instance.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Timings {
    pub empdag_finalize: f64,
    pub ccf_reformulation: f64,
    pub fooc: f64,
    pub solreport: f64,
    pub total: f64,
}

/// Scoped stopwatch feeding one timing slot.
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Add the elapsed time to a slot.
    pub fn stop_into(self, slot: &mut f64) {
        *slot += self.start.elapsed().as_secs_f64();
    }
}
