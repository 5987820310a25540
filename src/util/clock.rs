//! Stopwatch used for chain duration logging.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic stopwatch with lap support.
#[derive(Debug)]
pub struct Stopwatch {
    started: Instant,
    last_lap: Mutex<Instant>,
}

impl Stopwatch {
    /// Start timing now.
    #[must_use]
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_lap: Mutex::new(now),
        }
    }

    /// Time since start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the previous lap (or start), then begin a new lap.
    pub fn lap(&self) -> Duration {
        let now = Instant::now();
        let mut last = self.last_lap.lock();
        let lap = now.saturating_duration_since(*last);
        *last = now;
        lap
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laps_partition_elapsed() {
        let watch = Stopwatch::start();
        std::thread::sleep(Duration::from_millis(5));
        let first = watch.lap();
        std::thread::sleep(Duration::from_millis(5));
        let second = watch.lap();
        assert!(first >= Duration::from_millis(5));
        assert!(second >= Duration::from_millis(5));
        assert!(watch.elapsed() >= first + second);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(42)), 42);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
