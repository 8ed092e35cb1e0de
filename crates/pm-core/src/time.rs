//! Time utilities for peermux
//!
//! A process-wide monotonic millisecond clock used for activity tracking.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Milliseconds elapsed since the first call in this process.
///
/// Unaffected by wall-clock adjustments, so suitable for comparing
/// last-activity stamps.
pub fn monotonic_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Calculate elapsed monotonic time in milliseconds since a given stamp.
///
/// Returns 0 if the given stamp is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    monotonic_millis().saturating_sub(since)
}

/// Calculate elapsed time as a Duration since a given monotonic stamp.
pub fn elapsed_duration(since_millis: u64) -> Duration {
    Duration::from_millis(elapsed_millis(since_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_millis_advances() {
        let start = monotonic_millis();
        std::thread::sleep(Duration::from_millis(10));
        assert!(elapsed_millis(start) >= 10);
        assert!(monotonic_millis() >= start);
    }

    #[test]
    fn test_elapsed_millis_future_stamp() {
        let future = monotonic_millis() + 1_000_000;
        assert_eq!(elapsed_millis(future), 0);
        assert_eq!(elapsed_duration(future), Duration::ZERO);
    }
}
