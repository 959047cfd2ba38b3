//! Window/deadline CPU throttling
//!
//! Time is cut into fixed windows. A worker searches from the start of a
//! window until its work deadline (`window * fraction` later) and sleeps for
//! the rest of it.

use std::time::{Duration, Instant};

/// One scheduling window
#[derive(Debug, Clone, Copy)]
pub struct Slice {
    pub start: Instant,
    /// Stop searching at this point
    pub deadline: Instant,
    pub end: Instant,
}

/// Duty-cycle scheduler for one worker
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    fraction: f64,
    busy: Duration,
    started: Instant,
}

impl Throttle {
    /// `fraction` is clamped to `[0.1, 1.0]`
    pub fn new(window: Duration, fraction: f64) -> Self {
        Self {
            window,
            fraction: fraction.clamp(0.1, 1.0),
            busy: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// Open a window starting at `now`
    pub fn begin(&self, now: Instant) -> Slice {
        Slice {
            start: now,
            deadline: now + self.window.mul_f64(self.fraction),
            end: now + self.window,
        }
    }

    /// Close `slice` at `now`, returning how long to sleep before the next one
    pub fn finish(&mut self, slice: &Slice, now: Instant) -> Duration {
        self.busy += now.saturating_duration_since(slice.start);
        slice.end.saturating_duration_since(now)
    }

    /// Share of wall time spent inside work periods so far
    pub fn duty_cycle(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.busy.as_secs_f64() / elapsed).min(1.0)
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }
}
