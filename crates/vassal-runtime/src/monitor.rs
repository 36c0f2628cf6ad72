//! Harakiri monitor
//!
//! Runs in the master. Every pass compares the clock against each armed
//! deadline in the process table (worker, user, mule, spooler) and hands
//! expired ones to a [`HarakiriAction`], which by default kills the owner.
//! The deadline is then cleared unless its owner re-armed it meanwhile.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{error, warn};
use vassal_core::{Clock, CoreResult, Deadline, HarakiriKind};

use crate::memory::ProcessTable;
use crate::signal::kill_pid;

/// One expired deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarakiriEvent {
    pub kind: HarakiriKind,
    /// Worker id (1-based), or mule/spooler index
    pub id: usize,
    pub pid: i32,
    pub deadline: u64,
}

/// What to do with the owner of an expired deadline
pub trait HarakiriAction: Send + Sync {
    fn fire(&self, event: &HarakiriEvent);
}

/// Sends SIGKILL to the owner
#[derive(Debug, Default, Clone, Copy)]
pub struct KillAction;

impl HarakiriAction for KillAction {
    fn fire(&self, event: &HarakiriEvent) {
        if event.pid <= 0 {
            warn!(kind = %event.kind, id = event.id, "expired deadline has no owner pid");
            return;
        }
        if let Err(e) = kill_pid(event.pid, Signal::SIGKILL) {
            error!(pid = event.pid, error = %e, "unable to kill process");
        }
    }
}

/// Deadline scanner over a shared process table
pub struct HarakiriMonitor {
    table: Arc<ProcessTable>,
    clock: Arc<dyn Clock>,
    action: Arc<dyn HarakiriAction>,
}

impl HarakiriMonitor {
    pub fn new(table: Arc<ProcessTable>, clock: Arc<dyn Clock>, action: Arc<dyn HarakiriAction>) -> Self {
        Self { table, clock, action }
    }

    /// Scan once at the current time
    pub fn check_once(&self) -> Vec<HarakiriEvent> {
        self.check_at(self.clock.now_secs())
    }

    /// Scan once as if the time were `now`
    pub fn check_at(&self, now: u64) -> Vec<HarakiriEvent> {
        let mut events = Vec::new();
        let table = &*self.table;

        for id in 1..=table.workers() {
            let stats = table.worker(id);
            for (kind, deadline) in [
                (HarakiriKind::Worker, &stats.harakiri),
                (HarakiriKind::User, &stats.user_harakiri),
            ] {
                if let Some(event) = self.enforce(kind, id, stats.pid(), deadline, now) {
                    stats.harakiri_count.fetch_add(1, Ordering::Relaxed);
                    events.push(event);
                }
            }
        }
        for id in 0..table.mules() {
            let aux = table.mule(id);
            let pid = aux.pid.load(Ordering::Acquire);
            events.extend(self.enforce(HarakiriKind::Mule, id, pid, &aux.harakiri, now));
        }
        for id in 0..table.spoolers() {
            let aux = table.spooler(id);
            let pid = aux.pid.load(Ordering::Acquire);
            events.extend(self.enforce(HarakiriKind::Spooler, id, pid, &aux.harakiri, now));
        }
        events
    }

    fn enforce(
        &self,
        kind: HarakiriKind,
        id: usize,
        pid: i32,
        deadline: &Deadline,
        now: u64,
    ) -> Option<HarakiriEvent> {
        let armed = deadline.expired(now)?;
        error!(%kind, id, pid, "*** HARAKIRI ON {} {} (pid: {}) ***", owner_label(kind), id, pid);
        let event = HarakiriEvent {
            kind,
            id,
            pid,
            deadline: armed,
        };
        self.action.fire(&event);
        deadline.clear_if(armed);
        Some(event)
    }
}

fn owner_label(kind: HarakiriKind) -> &'static str {
    match kind {
        HarakiriKind::Worker | HarakiriKind::User => "WORKER",
        HarakiriKind::Mule => "MULE",
        HarakiriKind::Spooler => "SPOOLER",
    }
}

// ============================================================================
// Monitor thread
// ============================================================================

/// Background thread running [`HarakiriMonitor::check_once`] periodically
pub struct MonitorThread {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl MonitorThread {
    pub fn start(monitor: HarakiriMonitor, interval: Duration) -> CoreResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("vassal-harakiri".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    monitor.check_once();
                }
            })?;
        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
