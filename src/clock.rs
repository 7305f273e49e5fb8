//! Monotonic nanosecond clock with one process-wide epoch.
//!
//! All four packet timestamps are taken from this clock. The epoch is set on
//! first use and never moves, so timestamps are meaningful pairwise within
//! one process (t4 - t1 locally, t3 - t2 on the peer). The two peers' clocks
//! are not synchronised; subtracting a peer timestamp from a local one is
//! never valid.

use std::time::Instant;

use lazy_static::lazy_static;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Nanoseconds since the process-wide epoch. Monotonic, immune to wall-clock
/// adjustments.
pub fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_advances() {
        let a = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_ns();
        assert!(b - a >= 1_000_000, "clock advanced only {} ns", b - a);
    }
}
