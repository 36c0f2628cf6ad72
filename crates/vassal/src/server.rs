//! Prefork server
//!
//! ```text
//!   master ── bind sockets, map process table, open signal pipes
//!     ├── fork worker 1 ── WorkerThreads / AsyncEngine
//!     ├── fork worker 2 ── ...
//!     └── loop: reap + respawn, harakiri scan, shutdown on SIGTERM/SIGINT
//! ```
//!
//! Without a master the single worker runs in the calling process and the
//! SIGALRM handler stands in for the harakiri scan.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use tracing::{error, info, warn};
use vassal_core::{Application, AsyncId, Clock, CoreError, CoreResult, Protocol, SystemClock};
use vassal_runtime::async_engine::AsyncEngine;
use vassal_runtime::io::{close_fd, create_msg_pipe, write_all};
use vassal_runtime::monitor::{HarakiriMonitor, KillAction};
use vassal_runtime::signal::{
    install_harakiri_handler, install_shutdown_handlers, kill_pid, shutdown_requested,
    SignalChannel, SignalTable,
};
use vassal_runtime::{
    bind_listener, ListenSocket, PlatformEventQueue, ProcessTable, ServerConfig, WorkerContext,
    WorkerThreads,
};

/// How often a worker's main thread checks for shutdown
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Sends one-byte signals to workers over their signal pipes
#[derive(Clone)]
pub struct SignalSender {
    fds: Arc<Vec<RawFd>>,
}

impl SignalSender {
    /// Deliver `sig` to worker `worker_id` (1-based)
    pub fn send(&self, worker_id: usize, sig: u8) -> CoreResult<()> {
        let fd = worker_id
            .checked_sub(1)
            .and_then(|i| self.fds.get(i))
            .ok_or(CoreError::Config("no such worker"))?;
        write_all(*fd, &[sig], Duration::from_secs(1)).map(|_| ())
    }

    /// Deliver `sig` to every worker
    pub fn broadcast(&self, sig: u8) {
        for id in 1..=self.fds.len() {
            if let Err(e) = self.send(id, sig) {
                warn!(worker = id, signum = sig, error = %e, "unable to deliver signal");
            }
        }
    }
}

struct SignalPipe {
    master: RawFd,
    worker: RawFd,
}

/// A configured server, ready to run
pub struct Server {
    config: Arc<ServerConfig>,
    app: Arc<dyn Application>,
    protocol: Arc<dyn Protocol>,
    signals: Arc<SignalTable>,
    pipes: Vec<SignalPipe>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        app: Arc<dyn Application>,
        protocol: Arc<dyn Protocol>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let pipes = (0..config.workers)
            .map(|_| create_msg_pipe(None).map(|(master, worker)| SignalPipe { master, worker }))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            config: Arc::new(config),
            app,
            protocol,
            signals: Arc::new(SignalTable::new()),
            pipes,
        })
    }

    /// Handlers for signals delivered to the workers
    pub fn signal_table(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            fds: Arc::new(self.pipes.iter().map(|p| p.master).collect()),
        }
    }

    /// Bind, spawn and supervise until shutdown
    pub fn run(self) -> CoreResult<()> {
        let config = &self.config;
        config.log_summary();

        let listeners = config
            .listen
            .iter()
            .map(|addr| bind_listener(addr, config.listen_backlog))
            .collect::<CoreResult<Vec<OwnedFd>>>()?;
        let table = Arc::new(ProcessTable::new(
            config.workers,
            config.cores(),
            config.mules,
            config.spoolers,
        )?);

        install_shutdown_handlers()?;

        if !config.master {
            install_harakiri_handler()?;
            table.worker(1).mark_spawned(getpid().as_raw(), SystemClock.now_secs());
            info!(worker = 1, "running without a master");
            return self.run_worker(1, &table, &listeners);
        }

        let mut pids = vec![0i32; config.workers + 1];
        for id in 1..=config.workers {
            pids[id] = self.spawn_worker(id, &table, &listeners)?;
        }

        let monitor = HarakiriMonitor::new(
            Arc::clone(&table),
            Arc::new(SystemClock),
            Arc::new(KillAction),
        );

        while !shutdown_requested() {
            self.reap_and_respawn(&table, &listeners, &mut pids)?;
            monitor.check_once();
            thread::sleep(config.monitor_interval);
        }

        info!("shutting down workers");
        for pid in pids.iter().skip(1).filter(|p| **p > 0) {
            if let Err(e) = kill_pid(*pid, Signal::SIGTERM) {
                warn!(pid, error = %e, "unable to stop worker");
            }
        }
        for pid in pids.iter().skip(1).filter(|p| **p > 0) {
            let _ = waitpid(Pid::from_raw(*pid), None);
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        id: usize,
        table: &Arc<ProcessTable>,
        listeners: &[OwnedFd],
    ) -> CoreResult<i32> {
        // Safety: the master is single-threaded when it forks
        match unsafe { fork() }.map_err(|e| CoreError::Os(e as i32))? {
            ForkResult::Parent { child } => {
                let pid = child.as_raw();
                table.worker(id).mark_spawned(pid, SystemClock.now_secs());
                info!(worker = id, pid, "spawned worker");
                Ok(pid)
            }
            ForkResult::Child => {
                let code = match self.run_worker(id, table, listeners) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(worker = id, error = %e, "worker failed");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    fn reap_and_respawn(
        &self,
        table: &Arc<ProcessTable>,
        listeners: &[OwnedFd],
        pids: &mut [i32],
    ) -> CoreResult<()> {
        loop {
            let pid = match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    info!(pid = pid.as_raw(), code, "worker exited");
                    pid.as_raw()
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    warn!(pid = pid.as_raw(), signal = %sig, "worker killed");
                    pid.as_raw()
                }
                Ok(WaitStatus::StillAlive) | Err(_) => return Ok(()),
                Ok(_) => continue,
            };
            let Some(id) = table.find_worker(pid) else {
                continue;
            };
            if shutdown_requested() {
                pids[id] = 0;
                continue;
            }
            pids[id] = self.spawn_worker(id, table, listeners)?;
        }
    }

    /// Body of a worker process
    fn run_worker(
        &self,
        id: usize,
        table: &Arc<ProcessTable>,
        listeners: &[OwnedFd],
    ) -> CoreResult<()> {
        let config = &self.config;
        let cores = config.cores();
        let sockets = listeners
            .iter()
            .zip(&config.listen)
            .map(|(fd, name)| {
                ListenSocket::new(fd.as_raw_fd(), name.clone(), Arc::clone(&self.protocol), cores)
            })
            .collect();

        for (i, pipe) in self.pipes.iter().enumerate() {
            if config.master {
                close_fd(pipe.master);
            }
            if i + 1 != id {
                close_fd(pipe.worker);
            }
        }
        let signal_fd = self.pipes[id - 1].worker;

        let ctx = WorkerContext::new(
            Arc::clone(config),
            Arc::clone(table),
            id,
            Arc::clone(&self.app),
            sockets,
        )
        .with_signals(SignalChannel::new(vec![signal_fd], Arc::clone(&self.signals)));

        if config.is_async() {
            let queue = PlatformEventQueue::new()?;
            let mut engine = AsyncEngine::new(&ctx, queue)?;
            return engine.run();
        }

        let ctx = Arc::new(ctx);
        let threads = WorkerThreads::start(Arc::clone(&ctx))?;
        loop {
            if threads.all_finished() {
                threads.join();
                break;
            }
            if ctx.should_stop() {
                threads.cancel_all();
                wait_idle(&ctx, cores);
                break;
            }
            thread::sleep(WORKER_POLL);
        }
        let served = ctx.stats().delta_requests.load(Ordering::Relaxed);
        info!(worker = id, requests = served, "worker done");
        Ok(())
    }
}

/// Wait for in-flight requests on every core to finish
fn wait_idle(ctx: &WorkerContext, cores: usize) {
    while (0..cores).any(|i| ctx.core_stats(AsyncId::new(i as u32)).is_in_request()) {
        thread::sleep(WORKER_POLL);
    }
}
