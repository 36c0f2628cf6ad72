//! Shared statistics records
//!
//! These structures have fixed layouts (repr(C)) because they live in an
//! anonymous shared mapping created by the master before forking: workers
//! write them, the master's watchdog scan reads them.
//!
//! Every record is cache-line aligned so neighbouring workers or cores
//! never share a line.
//!
//! Index 0 of the worker array is the aggregate record: its `requests`
//! counter is the global request count across all workers.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use crate::harakiri::Deadline;

/// Per-worker-process statistics and watchdog state
///
/// Layout (128 bytes, cache-line aligned):
/// ```text
/// 0x00: pid                (i32)
/// 0x04: suspended          (u8)
/// 0x08: requests           (u64) - lifetime total
/// 0x10: delta_requests     (u64) - since last spawn
/// 0x18: running_time       (u64) - microseconds
/// 0x20: avg_response_time  (u64) - microseconds
/// 0x28: tx                 (u64) - bytes sent
/// 0x30: rss_size           (u64)
/// 0x38: vsz_size           (u64)
/// 0x40: harakiri           (u64) - absolute deadline, seconds
/// 0x48: user_harakiri      (u64) - absolute deadline, seconds
/// 0x50: last_spawn         (u64) - seconds
/// 0x58: respawn_count      (u64)
/// 0x60: harakiri_count     (u64)
/// ```
#[repr(C, align(64))]
pub struct WorkerStats {
    pub pid: AtomicI32,
    pub suspended: AtomicBool,
    pub requests: AtomicU64,
    pub delta_requests: AtomicU64,
    pub running_time: AtomicU64,
    pub avg_response_time: AtomicU64,
    pub tx: AtomicU64,
    pub rss_size: AtomicU64,
    pub vsz_size: AtomicU64,
    pub harakiri: Deadline,
    pub user_harakiri: Deadline,
    pub last_spawn: AtomicU64,
    pub respawn_count: AtomicU64,
    pub harakiri_count: AtomicU64,
}

impl WorkerStats {
    pub const fn new() -> Self {
        Self {
            pid: AtomicI32::new(0),
            suspended: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            delta_requests: AtomicU64::new(0),
            running_time: AtomicU64::new(0),
            avg_response_time: AtomicU64::new(0),
            tx: AtomicU64::new(0),
            rss_size: AtomicU64::new(0),
            vsz_size: AtomicU64::new(0),
            harakiri: Deadline::new(),
            user_harakiri: Deadline::new(),
            last_spawn: AtomicU64::new(0),
            respawn_count: AtomicU64::new(0),
            harakiri_count: AtomicU64::new(0),
        }
    }

    /// Record a (re)spawn of the worker owning this record
    pub fn mark_spawned(&self, pid: i32, now_secs: u64) {
        self.pid.store(pid, Ordering::Release);
        self.last_spawn.store(now_secs, Ordering::Release);
        self.delta_requests.store(0, Ordering::Release);
        self.harakiri.set(0);
        self.user_harakiri.set(0);
        self.respawn_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Fold one request duration into the running totals.
    ///
    /// The average is the halving recurrence `avg = (avg + d) / 2`, so recent
    /// requests dominate. Returns the new average.
    pub fn record_response_time(&self, duration_us: u64) -> u64 {
        self.running_time.fetch_add(duration_us, Ordering::Relaxed);
        let prev = self
            .avg_response_time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
                Some((avg + duration_us) / 2)
            })
            .unwrap_or(0);
        (prev + duration_us) / 2
    }

    /// Count one completed request; returns the requests served since spawn
    #[inline]
    pub fn count_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.delta_requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn add_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_memory(&self, rss: u64, vsz: u64) {
        self.rss_size.store(rss, Ordering::Relaxed);
        self.vsz_size.store(vsz, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-core counters
#[repr(C, align(64))]
pub struct CoreStats {
    pub in_request: AtomicBool,
    pub requests: AtomicU64,
    pub write_errors: AtomicU64,
}

impl CoreStats {
    pub const fn new() -> Self {
        Self {
            in_request: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_in_request(&self) -> bool {
        self.in_request.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_in_request(&self, value: bool) {
        self.in_request.store(value, Ordering::Release);
    }

    #[inline]
    pub fn count_request(&self, write_errors: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if write_errors > 0 {
            self.write_errors.fetch_add(write_errors, Ordering::Relaxed);
        }
    }
}

impl Default for CoreStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog record for auxiliary processes (mules and spoolers)
#[repr(C, align(64))]
pub struct AuxStats {
    pub pid: AtomicI32,
    pub harakiri: Deadline,
}

impl AuxStats {
    pub const fn new() -> Self {
        Self {
            pid: AtomicI32::new(0),
            harakiri: Deadline::new(),
        }
    }
}

impl Default for AuxStats {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(core::mem::size_of::<WorkerStats>() == 128);
    assert!(core::mem::align_of::<WorkerStats>() == 64);
    assert!(core::mem::size_of::<CoreStats>() == 64);
    assert!(core::mem::size_of::<AuxStats>() == 64);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(core::mem::size_of::<WorkerStats>(), 128);
        assert_eq!(core::mem::align_of::<CoreStats>(), 64);
    }

    #[test]
    fn test_average_recurrence() {
        let stats = WorkerStats::new();
        let avgs: Vec<u64> = [100, 300, 500]
            .iter()
            .map(|d| stats.record_response_time(*d))
            .collect();
        assert_eq!(avgs, vec![50, 175, 337]);
        assert_eq!(stats.avg_response_time.load(Ordering::Relaxed), 337);
        assert_eq!(stats.running_time.load(Ordering::Relaxed), 900);
    }

    #[test]
    fn test_count_request_and_respawn() {
        let stats = WorkerStats::new();
        assert_eq!(stats.count_request(), 1);
        assert_eq!(stats.count_request(), 2);
        assert_eq!(stats.requests.load(Ordering::Relaxed), 2);

        stats.harakiri.set(99);
        stats.mark_spawned(4242, 1000);
        assert_eq!(stats.pid(), 4242);
        assert_eq!(stats.delta_requests.load(Ordering::Relaxed), 0);
        assert_eq!(stats.requests.load(Ordering::Relaxed), 2);
        assert!(!stats.harakiri.is_armed());
        assert_eq!(stats.last_spawn.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_core_stats() {
        let core = CoreStats::new();
        assert!(!core.is_in_request());
        core.set_in_request(true);
        assert!(core.is_in_request());
        core.count_request(0);
        core.count_request(3);
        assert_eq!(core.requests.load(Ordering::Relaxed), 2);
        assert_eq!(core.write_errors.load(Ordering::Relaxed), 3);
    }
}
