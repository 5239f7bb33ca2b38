use std::time::{Duration, Instant};

/// A finished measurement bounded by two instants.
///
/// Timers are plain values: capture a start with [`Timer::start`] and turn it
/// into a `Timer` with [`Started::stop`], or build one from two instants that
/// were recorded elsewhere (for example by the HTTP transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    start: Instant,
    end: Instant,
}

/// A timer that has been started but not stopped yet.
#[derive(Debug, Clone, Copy)]
pub struct Started(Instant);

impl Timer {
    pub fn start() -> Started {
        Started(Instant::now())
    }

    pub fn between(start: Instant, end: Instant) -> Self {
        Timer { start, end }
    }

    pub fn ended_at(&self) -> Instant {
        self.end
    }

    /// Elapsed time, clamped to zero if `end` precedes `start`.
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

impl Started {
    pub fn stop(self) -> Timer {
        Timer::between(self.0, Instant::now())
    }
}
