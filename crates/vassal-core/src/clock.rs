//! Wall clock abstraction
//!
//! Watchdog deadlines, heartbeat cadence and request timing all read the
//! clock through this trait so they can be driven deterministically.

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now_secs(&self) -> u64 {
        self.now_micros() / 1_000_000
    }

    /// Microseconds since the Unix epoch
    fn now_micros(&self) -> u64;
}

/// The real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self {
            micros: AtomicU64::new(secs * 1_000_000),
        }
    }

    pub fn set_secs(&self, secs: u64) {
        self.micros.store(secs * 1_000_000, Ordering::SeqCst);
    }

    pub fn set_micros(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    pub fn advance_micros(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now_secs(), 10);
        clock.advance_micros(2_500_000);
        assert_eq!(clock.now_secs(), 12);
        assert_eq!(clock.now_micros(), 12_500_000);
        clock.set_secs(3);
        assert_eq!(clock.now_secs(), 3);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(a > 0);
        assert!(b >= a);
    }
}
