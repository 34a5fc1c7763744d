//! Run statistics and the rate-limited progress reporter.
//!
//! Counters are bumped with atomic adds from IO completion contexts and read
//! by the reporter without locking; reads are eventually consistent, which
//! is all a progress line needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::STATS_INTERVAL;

/// Monotone byte counters for one run.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_to_zero: AtomicU64,
    bytes_zeroed: AtomicU64,
}

impl Stats {
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_zeroed(&self, n: u64) {
        self.bytes_zeroed.fetch_add(n, Ordering::Relaxed);
    }

    /// Records the total byte count the punch phase will deallocate.
    pub fn set_to_zero(&self, n: u64) {
        self.bytes_to_zero.store(n, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_to_zero(&self) -> u64 {
        self.bytes_to_zero.load(Ordering::Relaxed)
    }

    pub fn bytes_zeroed(&self) -> u64 {
        self.bytes_zeroed.load(Ordering::Relaxed)
    }
}

/// Gate for periodic progress lines.
///
/// `due()` returns `true` at most once per interval; callers poll it from
/// dispatch loops and drain waits, so reporting costs nothing between
/// intervals.
pub struct ProgressTimer {
    last: Instant,
    interval: Duration,
}

impl ProgressTimer {
    pub fn new(interval: Duration) -> ProgressTimer {
        ProgressTimer {
            last: Instant::now(),
            interval,
        }
    }

    /// Returns whether an interval elapsed since the last report, resetting
    /// the gate when it did.
    pub fn due(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

impl Default for ProgressTimer {
    fn default() -> Self {
        ProgressTimer::new(STATS_INTERVAL)
    }
}

/// Formats a byte count as MiB with two decimals, the unit every progress
/// line uses.
pub fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1048576.0
}

/// Formats a whole-second duration as `H hours, M minutes, S seconds`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let mut seconds = elapsed.as_secs();
    let hours = seconds / (60 * 60);
    seconds %= 60 * 60;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours} hours, {minutes} minutes, {seconds} seconds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::default();
        stats.add_read(4096);
        stats.add_read(4096);
        stats.add_written(100);
        stats.add_zeroed(8192);
        stats.set_to_zero(16384);
        assert_eq!(stats.bytes_read(), 8192);
        assert_eq!(stats.bytes_written(), 100);
        assert_eq!(stats.bytes_zeroed(), 8192);
        assert_eq!(stats.bytes_to_zero(), 16384);
    }

    #[test]
    fn timer_gates_until_interval_elapses() {
        let mut timer = ProgressTimer::new(Duration::from_millis(30));
        assert!(!timer.due());
        std::thread::sleep(Duration::from_millis(40));
        assert!(timer.due());
        // Reset after firing.
        assert!(!timer.due());
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(
            format_elapsed(Duration::from_secs(0)),
            "0 hours, 0 minutes, 0 seconds"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(3 * 3600 + 42 * 60 + 7)),
            "3 hours, 42 minutes, 7 seconds"
        );
    }

    #[test]
    fn mib_conversion() {
        assert_eq!(mib(1048576), 1.0);
        assert_eq!(mib(0), 0.0);
    }
}
