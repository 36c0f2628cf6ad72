//! Link to the supervising parent (the "emperor")
//!
//! Two one-byte messages travel over the link:
//! - heartbeat (26), at most once per interval, sent from the accept loop;
//! - loyalty (17), exactly once, after the first completed request.
//!
//! Heartbeat deadlines stay anchored to the schedule: the next deadline is
//! the previous one plus the interval, unless the worker fell more than a
//! whole interval behind, in which case it restarts from now.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, info};
use vassal_core::constants::{HEARTBEAT_BYTE, LOYALTY_BYTE};
use vassal_core::SupervisorLink;

/// Writes single bytes to a raw descriptor inherited from the parent
#[derive(Debug, Clone, Copy)]
pub struct FdLink {
    fd: RawFd,
}

impl FdLink {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl SupervisorLink for FdLink {
    fn send_byte(&self, byte: u8) -> std::io::Result<()> {
        let n = unsafe { libc::write(self.fd, &byte as *const u8 as *const libc::c_void, 1) };
        if n != 1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Heartbeat and loyalty state for one worker
pub struct Supervisor {
    link: Box<dyn SupervisorLink>,
    /// Seconds; 0 disables heartbeats
    interval: u64,
    next_heartbeat: AtomicU64,
    loyal: AtomicBool,
}

impl Supervisor {
    /// First heartbeat is due one interval after `now_secs`
    pub fn new(link: Box<dyn SupervisorLink>, interval: u64, now_secs: u64) -> Self {
        Self {
            link,
            interval,
            next_heartbeat: AtomicU64::new(now_secs + interval),
            loyal: AtomicBool::new(false),
        }
    }

    /// Interval to cap the accept wait with, if heartbeats are enabled
    #[inline]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.interval > 0).then(|| Duration::from_secs(self.interval))
    }

    #[inline]
    pub fn next_heartbeat(&self) -> u64 {
        self.next_heartbeat.load(Ordering::Acquire)
    }

    /// Send a heartbeat once `now_secs` has passed the deadline; true when sent
    pub fn heartbeat(&self, now_secs: u64) -> bool {
        if self.interval == 0 {
            return false;
        }
        let due = self.next_heartbeat();
        if now_secs <= due {
            return false;
        }
        let anchored = due + self.interval;
        let next = if anchored > now_secs {
            anchored
        } else {
            now_secs + self.interval
        };
        // Several threads may race here; exactly one wins the slot
        if self
            .next_heartbeat
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Err(e) = self.link.send_byte(HEARTBEAT_BYTE) {
            error!(error = %e, "unable to send heartbeat to the emperor");
        }
        true
    }

    /// Announce loyalty once; true only on the call that sent it
    pub fn announce_loyalty(&self) -> bool {
        if self.loyal.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("announcing my loyalty to the Emperor...");
        if let Err(e) = self.link.send_byte(LOYALTY_BYTE) {
            error!(error = %e, "unable to announce loyalty to the emperor");
        }
        true
    }

    #[inline]
    pub fn is_loyal(&self) -> bool {
        self.loyal.load(Ordering::Acquire)
    }
}
