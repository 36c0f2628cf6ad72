//! Worker process context and per-core threads
//!
//! A [`WorkerContext`] is built once per worker process after fork. It holds
//! the read-mostly configuration, this worker's view of the shared process
//! table, the listening sockets and the collaborators every core uses. Cores
//! borrow it immutably; the only mutable per-core state is the [`CoreSlot`]
//! each core owns.
//!
//! ```text
//!   WorkerThreads
//!     thread 0 ──> run_core(ctx, slot 0, queue 0)
//!     thread 1 ──> run_core(ctx, slot 1, queue 1)
//!     ...          setup -> accept -> receive -> dispatch -> close
//! ```

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};
use vassal_core::{
    AlarmFallback, Application, AsyncId, CancelState, Clock, CoreError, CoreResult, CoreSlot,
    CoreStats, EventQueue, HarakiriKind, Protocol, Request, SystemClock, ThunderLock, Watchdog,
    WorkerStats,
};

use crate::accept::accept_request;
use crate::config::ServerConfig;
use crate::event::PlatformEventQueue;
use crate::memory::ProcessTable;
use crate::setup::{dispatch_request, receive_request, setup_request};
use crate::signal::{shutdown_requested, SignalChannel, SysAlarm};
use crate::socket::ListenSocket;
use crate::supervisor::{FdLink, Supervisor};
use crate::teardown::{close_request, destroy_request, TeardownOutcome};
use crate::thunder::new_thunder_lock;

/// Why a worker decided to retire itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    MaxRequests,
    AddressSpace,
    ResidentSet,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetireReason::MaxRequests => write!(f, "max requests reached"),
            RetireReason::AddressSpace => write!(f, "address space limit reached"),
            RetireReason::ResidentSet => write!(f, "resident set limit reached"),
        }
    }
}

/// Everything the cores of one worker process share
pub struct WorkerContext {
    config: Arc<ServerConfig>,
    worker_id: usize,
    table: Arc<ProcessTable>,
    sockets: Vec<ListenSocket>,
    thunder: Arc<dyn ThunderLock>,
    supervisor: Option<Supervisor>,
    signals: SignalChannel,
    app: Arc<dyn Application>,
    clock: Arc<dyn Clock>,
    alarm: Arc<dyn AlarmFallback>,
    retiring: AtomicBool,
}

impl WorkerContext {
    /// Context for worker `worker_id` (1-based) with the system clock and
    /// alarm, the configured thunder lock and, when an emperor fd is set, a
    /// supervisor link.
    pub fn new(
        config: Arc<ServerConfig>,
        table: Arc<ProcessTable>,
        worker_id: usize,
        app: Arc<dyn Application>,
        sockets: Vec<ListenSocket>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let shared = config.workers > 1 || config.threads > 1;
        let thunder = new_thunder_lock(config.thunder_lock && shared, Some(Arc::clone(&table)));
        let supervisor = config
            .emperor_fd
            .map(|fd| Supervisor::new(Box::new(FdLink::new(fd)), config.heartbeat, clock.now_secs()));
        Self {
            config,
            worker_id,
            table,
            sockets,
            thunder,
            supervisor,
            signals: SignalChannel::none(),
            app,
            clock,
            alarm: Arc::new(SysAlarm),
            retiring: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_alarm(mut self, alarm: Arc<dyn AlarmFallback>) -> Self {
        self.alarm = alarm;
        self
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_signals(mut self, signals: SignalChannel) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_thunder_lock(mut self, lock: Arc<dyn ThunderLock>) -> Self {
        self.thunder = lock;
        self
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// This worker's shared record
    #[inline]
    pub fn stats(&self) -> &WorkerStats {
        self.table.worker(self.worker_id)
    }

    #[inline]
    pub fn core_stats(&self, id: AsyncId) -> &CoreStats {
        self.table.core(self.worker_id, id.as_usize())
    }

    #[inline]
    pub fn sockets(&self) -> &[ListenSocket] {
        &self.sockets
    }

    #[inline]
    pub fn thunder(&self) -> &dyn ThunderLock {
        self.thunder.as_ref()
    }

    #[inline]
    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    #[inline]
    pub fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    #[inline]
    pub fn app(&self) -> &dyn Application {
        self.app.as_ref()
    }

    #[inline]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Request watchdog of this worker
    pub fn harakiri(&self) -> Watchdog<'_> {
        Watchdog::new(
            HarakiriKind::Worker,
            &self.stats().harakiri,
            self.clock.as_ref(),
            self.alarm.as_ref(),
            self.config.master,
            self.config.harakiri,
        )
    }

    /// Application-controlled watchdog; needs a master
    pub fn user_harakiri(&self) -> Watchdog<'_> {
        Watchdog::new(
            HarakiriKind::User,
            &self.stats().user_harakiri,
            self.clock.as_ref(),
            self.alarm.as_ref(),
            self.config.master,
            0,
        )
    }

    /// Watchdog of mule `index`, for code running inside that mule
    pub fn mule_harakiri(&self, index: usize, base_secs: u64) -> Watchdog<'_> {
        Watchdog::new(
            HarakiriKind::Mule,
            &self.table.mule(index).harakiri,
            self.clock.as_ref(),
            self.alarm.as_ref(),
            self.config.master,
            base_secs,
        )
    }

    /// Watchdog of spooler `index`, for code running inside that spooler
    pub fn spooler_harakiri(&self, index: usize, base_secs: u64) -> Watchdog<'_> {
        Watchdog::new(
            HarakiriKind::Spooler,
            &self.table.spooler(index).harakiri,
            self.clock.as_ref(),
            self.alarm.as_ref(),
            self.config.master,
            base_secs,
        )
    }

    /// Index of the listening socket owning `fd`
    pub fn socket_index(&self, fd: RawFd) -> Option<usize> {
        self.sockets.iter().position(|s| s.fd() == fd)
    }

    /// Socket a request was accepted from
    pub fn socket_for(&self, req: &Request) -> Option<&ListenSocket> {
        self.sockets.get(req.socket?)
    }

    pub fn protocol_for(&self, req: &Request) -> Option<&Arc<dyn Protocol>> {
        self.socket_for(req).map(ListenSocket::protocol)
    }

    /// Ask every core to stop after its current request
    pub fn retire(&self, reason: RetireReason) {
        if !self.retiring.swap(true, Ordering::AcqRel) {
            info!(worker = self.worker_id, %reason, "worker retiring");
        }
    }

    #[inline]
    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    /// Retiring, or the process received a shutdown signal
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.is_retiring() || shutdown_requested()
    }

    /// Register the listening sockets and signal descriptors core `id` waits on
    pub fn register_core(&self, queue: &dyn EventQueue, id: AsyncId) -> CoreResult<()> {
        for sock in &self.sockets {
            for fd in sock.watch_fds(id) {
                queue.add_read(fd)?;
            }
        }
        for fd in self.signals.fds() {
            queue.add_read(*fd)?;
        }
        Ok(())
    }
}

// ============================================================================
// Synchronous core loop
// ============================================================================

/// Serve requests on one core until the worker stops or the thread is cancelled
pub fn run_core(
    ctx: &WorkerContext,
    slot: &mut CoreSlot,
    queue: &dyn EventQueue,
    cancel: Option<&CancelState>,
) {
    let id = slot.id();
    while !ctx.should_stop() && !cancel.is_some_and(CancelState::is_cancelled) {
        setup_request(ctx, slot, None);

        match accept_request(ctx, queue, slot, cancel) {
            Ok(()) => {}
            Err(CoreError::NoRequest) => continue,
            Err(e) => {
                debug!(worker = ctx.worker_id(), core = %id, error = %e, "accept failed");
                continue;
            }
        }

        if let Err(e) = receive_request(ctx, slot) {
            debug!(worker = ctx.worker_id(), core = %id, error = %e, "receive failed");
            destroy_request(ctx, slot, cancel);
            continue;
        }

        if let Err(e) = dispatch_request(ctx, slot) {
            warn!(worker = ctx.worker_id(), core = %id, error = %e, "dispatch failed");
        }

        if let TeardownOutcome::Retire(_) = close_request(ctx, slot, cancel) {
            break;
        }
    }
    debug!(worker = ctx.worker_id(), core = %id, "core loop finished");
}

/// One OS thread per core, each with its own readiness queue
pub struct WorkerThreads {
    handles: Vec<JoinHandle<()>>,
    cancels: Vec<Arc<CancelState>>,
}

impl WorkerThreads {
    /// Spawn `ctx.config().threads` core threads
    pub fn start(ctx: Arc<WorkerContext>) -> CoreResult<Self> {
        let config = ctx.config();
        let threads = config.threads;
        let mut handles = Vec::with_capacity(threads);
        let mut cancels = Vec::with_capacity(threads);

        for i in 0..threads {
            let id = AsyncId::new(i as u32);
            let mut slot = CoreSlot::new(id, config.buffer_size, config.hvec_slots, config.post_buffering);
            let queue = PlatformEventQueue::new()?;
            ctx.register_core(&queue, id)?;

            let cancel = Arc::new(CancelState::new());
            cancels.push(Arc::clone(&cancel));

            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("vassal-core-{}", i))
                .spawn(move || {
                    run_core(&ctx, &mut slot, &queue, Some(&cancel));
                })?;
            handles.push(handle);
        }

        info!(worker = ctx.worker_id(), threads, "core threads started");
        Ok(Self { handles, cancels })
    }

    /// Request cooperative cancellation of every core thread
    pub fn cancel_all(&self) {
        for cancel in &self.cancels {
            cancel.request();
        }
    }

    /// True once every core thread has returned
    pub fn all_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for all core threads to finish
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("core thread panicked");
            }
        }
    }
}
