//! Harakiri watchdog
//!
//! A watchdog is an absolute deadline (seconds since the epoch, 0 = disarmed)
//! stored in a shared record. Under a master process, the master's periodic
//! scan kills the owner of any deadline that has passed. Without a master
//! the worker falls back to the process alarm signal instead.
//!
//! ```text
//!   arm(S)      S > 0 : deadline = now + S      (no master: alarm(S))
//!   arm(0)            : deadline = 0            (no master: alarm(0))
//!   extend(S)         : deadline += S           (no master: alarm(base + S))
//!   disarm()          : arm(0) if armed
//! ```
//!
//! The user kind only exists under a master; arming it without one is
//! refused and logged.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};

/// Which watchdog a deadline belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarakiriKind {
    /// Armed by the server around each request
    Worker,
    /// Armed explicitly by application code
    User,
    /// Auxiliary task process
    Mule,
    /// Queued-job process
    Spooler,
}

impl fmt::Display for HarakiriKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HarakiriKind::Worker => "harakiri",
            HarakiriKind::User => "user harakiri",
            HarakiriKind::Mule => "mule harakiri",
            HarakiriKind::Spooler => "spooler harakiri",
        };
        f.write_str(name)
    }
}

/// Absolute watchdog deadline in seconds; 0 means disarmed
#[repr(transparent)]
pub struct Deadline(AtomicU64);

impl Deadline {
    pub const fn new() -> Self {
        Deadline(AtomicU64::new(0))
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::Release);
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.get() > 0
    }

    /// True once the deadline is strictly in the past
    #[inline]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expired(now_secs).is_some()
    }

    /// The armed deadline, read once, if it is strictly in the past
    #[inline]
    pub fn expired(&self, now_secs: u64) -> Option<u64> {
        let deadline = self.get();
        (deadline > 0 && deadline < now_secs).then_some(deadline)
    }

    /// Clear the deadline if it still holds `expected`.
    ///
    /// Used by the watchdog scan so a worker that re-armed in the meantime
    /// keeps its fresh deadline.
    #[inline]
    pub fn clear_if(&self, expected: u64) -> bool {
        self.0
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deadline({})", self.get())
    }
}

/// Process-level alarm used when no master is watching.
///
/// `schedule(0)` cancels a pending alarm.
pub trait AlarmFallback: Send + Sync {
    fn schedule(&self, secs: u64);
}

/// A view over one deadline with the policy needed to arm it
pub struct Watchdog<'a> {
    kind: HarakiriKind,
    deadline: &'a Deadline,
    clock: &'a dyn Clock,
    alarm: &'a dyn AlarmFallback,
    has_master: bool,
    base_secs: u64,
}

impl<'a> Watchdog<'a> {
    /// `base_secs` is the configured timeout for this kind; it is only used
    /// to recompute the alarm when extending without a master.
    pub fn new(
        kind: HarakiriKind,
        deadline: &'a Deadline,
        clock: &'a dyn Clock,
        alarm: &'a dyn AlarmFallback,
        has_master: bool,
        base_secs: u64,
    ) -> Self {
        Self {
            kind,
            deadline,
            clock,
            alarm,
            has_master,
            base_secs,
        }
    }

    #[inline]
    pub fn kind(&self) -> HarakiriKind {
        self.kind
    }

    #[inline]
    pub fn deadline(&self) -> u64 {
        self.deadline.get()
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_armed()
    }

    fn require_master(&self) -> CoreResult<()> {
        if self.kind == HarakiriKind::User && !self.has_master {
            warn!("unable to set user harakiri without the master process");
            return Err(CoreError::MasterRequired);
        }
        Ok(())
    }

    /// Arm the watchdog `secs` seconds from now; 0 disarms.
    pub fn arm(&self, secs: u64) -> CoreResult<()> {
        self.require_master()?;
        if secs == 0 {
            self.deadline.set(0);
        } else {
            self.deadline.set(self.clock.now_secs() + secs);
        }
        if !self.has_master {
            self.alarm.schedule(secs);
        }
        debug!(kind = %self.kind, secs, "watchdog armed");
        Ok(())
    }

    /// Push an armed deadline further out by `secs`.
    ///
    /// A disarmed watchdog stays disarmed under a master.
    pub fn extend(&self, secs: u64) -> CoreResult<()> {
        self.require_master()?;
        if self.has_master {
            if self.deadline.is_armed() {
                self.deadline.0.fetch_add(secs, Ordering::AcqRel);
            }
        } else {
            self.alarm.schedule(self.base_secs + secs);
        }
        Ok(())
    }

    /// Disarm if armed
    pub fn disarm(&self) -> CoreResult<()> {
        if self.deadline.is_armed() {
            self.arm(0)?;
        }
        Ok(())
    }
}
