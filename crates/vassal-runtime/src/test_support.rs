//! Shared test doubles for the runtime's unit tests

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vassal_core::{
    AlarmFallback, Application, CoreBuffers, CoreError, CoreResult, EventQueue, ManualClock,
    Protocol, ReceiveStatus, Request, RequestContext, SupervisorLink,
};

use crate::config::ServerConfig;
use crate::memory::ProcessTable;
use crate::socket::ListenSocket;
use crate::supervisor::Supervisor;
use crate::worker::WorkerContext;

/// Supervisor link that remembers every byte
#[derive(Default)]
pub struct RecordingLink {
    sent: Arc<Mutex<Vec<u8>>>,
}

impl RecordingLink {
    pub fn sent(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.sent)
    }
}

impl SupervisorLink for RecordingLink {
    fn send_byte(&self, byte: u8) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(byte);
        Ok(())
    }
}

/// Alarm that records scheduled seconds instead of signalling
#[derive(Default)]
pub struct RecordingAlarm {
    pub calls: Mutex<Vec<u64>>,
}

impl AlarmFallback for RecordingAlarm {
    fn schedule(&self, secs: u64) {
        self.calls.lock().unwrap().push(secs);
    }
}

/// Scripted protocol.
///
/// `accept` duplicates the ready descriptor so tests get a real fd to
/// close. `receive_step` pops scripted statuses and reports `Complete`
/// once the script runs out.
#[derive(Default)]
pub struct MockProtocol {
    pub script: Mutex<VecDeque<ReceiveStatus>>,
    pub written: Mutex<Vec<u8>>,
    pub accepts: AtomicUsize,
    pub accepted_from: Mutex<Vec<RawFd>>,
    pub closes: AtomicUsize,
    pub fail_accept: AtomicBool,
    pub fail_writes: AtomicBool,
    pub request_retry: AtomicBool,
}

impl MockProtocol {
    pub fn scripted(steps: &[ReceiveStatus]) -> Self {
        let proto = Self::default();
        proto.script.lock().unwrap().extend(steps.iter().copied());
        proto
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl Protocol for MockProtocol {
    fn accept(&self, req: &mut Request, listen_fd: RawFd) -> CoreResult<RawFd> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        self.accepted_from.lock().unwrap().push(listen_fd);
        if self.fail_accept.load(Ordering::SeqCst) {
            return Err(CoreError::Accept(libc::EAGAIN));
        }
        req.retry_requested = self.request_retry.load(Ordering::SeqCst);
        let fd = unsafe { libc::dup(listen_fd) };
        if fd < 0 {
            return Err(CoreError::Accept(vassal_core::last_errno()));
        }
        Ok(fd)
    }

    fn receive_step(&self, req: &mut Request, buffers: &mut CoreBuffers) -> ReceiveStatus {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReceiveStatus::Complete);
        if step == ReceiveStatus::Complete {
            buffers.buffer[..5].copy_from_slice(b"hello");
            req.pktsize = 5;
            req.header_len = 0;
        }
        step
    }

    fn write(&self, _req: &mut Request, data: &[u8]) -> CoreResult<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::PeerClosed);
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn close(&self, req: &mut Request) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(fd) = req.fd {
            if !req.fd_closed {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        req.fd_closed = true;
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Application that echoes the payload and counts hook invocations
#[derive(Default)]
pub struct EchoApp {
    pub handled: AtomicUsize,
    pub after_accounting: AtomicUsize,
    pub after_request: AtomicUsize,
    /// Start a response without writing a body
    pub headers_only: AtomicBool,
}

impl Application for EchoApp {
    fn handle(&self, ctx: &mut RequestContext<'_>) -> i32 {
        self.handled.fetch_add(1, Ordering::SeqCst);
        ctx.start_response(200, "OK");
        if self.headers_only.load(Ordering::SeqCst) {
            return 0;
        }
        let body = ctx.payload().to_vec();
        match ctx.write(&body) {
            Ok(_) => 0,
            Err(_) => -1,
        }
    }

    fn after_accounting(&self, _ctx: &mut RequestContext<'_>) {
        self.after_accounting.fetch_add(1, Ordering::SeqCst);
    }

    fn after_request(&self, _ctx: &mut RequestContext<'_>) {
        self.after_request.fetch_add(1, Ordering::SeqCst);
    }
}

/// Event queue returning pre-scripted wait results
#[derive(Default)]
pub struct ScriptedQueue {
    pub results: Mutex<VecDeque<Option<RawFd>>>,
    pub waits: Mutex<Vec<Option<Duration>>>,
    pub added: Mutex<Vec<RawFd>>,
    pub removed: Mutex<Vec<RawFd>>,
    pub fail_remove: AtomicBool,
}

impl ScriptedQueue {
    pub fn with_results(results: &[Option<RawFd>]) -> Self {
        let queue = Self::default();
        queue.results.lock().unwrap().extend(results.iter().copied());
        queue
    }
}

impl EventQueue for ScriptedQueue {
    fn add_read(&self, fd: RawFd) -> CoreResult<()> {
        self.added.lock().unwrap().push(fd);
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> CoreResult<()> {
        self.removed.lock().unwrap().push(fd);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(CoreError::EventQueue(libc::ENOENT));
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> CoreResult<Option<RawFd>> {
        self.waits.lock().unwrap().push(timeout);
        Ok(self.results.lock().unwrap().pop_front().flatten())
    }
}

/// A single-worker context over mocks, driven by a manual clock
pub struct Harness {
    pub ctx: WorkerContext,
    pub clock: Arc<ManualClock>,
    pub alarm: Arc<RecordingAlarm>,
    pub proto: Arc<MockProtocol>,
    pub app: Arc<EchoApp>,
    pub link: Option<Arc<Mutex<Vec<u8>>>>,
}

pub struct HarnessBuilder {
    config: ServerConfig,
    proto: MockProtocol,
    listen_fds: Vec<RawFd>,
    thread_fds: Option<Vec<RawFd>>,
    edge_triggered: bool,
    heartbeat: Option<u64>,
    now: u64,
}

impl HarnessBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            proto: MockProtocol::default(),
            listen_fds: Vec::new(),
            thread_fds: None,
            edge_triggered: false,
            heartbeat: None,
            now: 1_000,
        }
    }

    pub fn protocol(mut self, proto: MockProtocol) -> Self {
        self.proto = proto;
        self
    }

    pub fn listen_fd(mut self, fd: RawFd) -> Self {
        self.listen_fds.push(fd);
        self
    }

    /// Per-core duplicates of every listening socket, indexed by core
    pub fn thread_fds(mut self, fds: Vec<RawFd>) -> Self {
        self.thread_fds = Some(fds);
        self
    }

    pub fn edge_triggered(mut self) -> Self {
        self.edge_triggered = true;
        self
    }

    /// Attach a recording supervisor with this heartbeat interval
    pub fn supervised(mut self, heartbeat: u64) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn now(mut self, secs: u64) -> Self {
        self.now = secs;
        self
    }

    pub fn build(self) -> Harness {
        let config = Arc::new(self.config);
        let cores = config.cores();
        let table = Arc::new(
            ProcessTable::new(config.workers, cores, config.mules, config.spoolers).unwrap(),
        );
        let clock = Arc::new(ManualClock::new(self.now));
        let alarm = Arc::new(RecordingAlarm::default());
        let proto = Arc::new(self.proto);
        let app = Arc::new(EchoApp::default());

        let sockets = self
            .listen_fds
            .iter()
            .map(|fd| {
                let proto: Arc<dyn Protocol> = proto.clone();
                let sock = ListenSocket::new(*fd, format!("test-{fd}"), proto, cores)
                    .edge_triggered(self.edge_triggered);
                match &self.thread_fds {
                    Some(fds) => sock.with_thread_fds(fds.clone()),
                    None => sock,
                }
            })
            .collect();

        table.worker(1).mark_spawned(std::process::id() as i32, 0);

        let mut ctx = WorkerContext::new(Arc::clone(&config), table, 1, app.clone(), sockets)
            .with_clock(clock.clone())
            .with_alarm(alarm.clone());

        let mut link_log = None;
        if let Some(interval) = self.heartbeat {
            let link = RecordingLink::default();
            link_log = Some(link.sent());
            ctx = ctx.with_supervisor(Supervisor::new(Box::new(link), interval, self.now));
        }

        Harness {
            ctx,
            clock,
            alarm,
            proto,
            app,
            link: link_log,
        }
    }
}
