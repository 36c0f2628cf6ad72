//! Asynchronous core engine
//!
//! One thread multiplexes every async core of the worker over a single
//! readiness queue. Idle cores wait in a free queue; a core holding a
//! partially received request is indexed by its connection descriptor so a
//! readiness event resumes exactly that core.
//!
//! # Receive timeouts
//!
//! Timeouts sit in a min-heap keyed by deadline. Cancelling a timeout only
//! bumps the core's generation; stale heap entries are skipped when popped,
//! which avoids O(n) removal from the heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tracing::{debug, info, warn};
use vassal_core::{AsyncId, CoreResult, CorePool, EventQueue, ReceiveStatus};

use crate::accept::simple_accept;
use crate::setup::{dispatch_request, receive_request_async, setup_request};
use crate::teardown::{close_request, destroy_request};
use crate::worker::WorkerContext;

// ============================================================================
// Lookup table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeoutEntry {
    deadline: u64,
    id: AsyncId,
    generation: u64,
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap; ties broken by id for determinism
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.as_u32().cmp(&self.id.as_u32()))
    }
}

/// Descriptor index and receive timeouts of the async cores
pub struct AsyncTable {
    by_fd: HashMap<RawFd, AsyncId>,
    timeouts: BinaryHeap<TimeoutEntry>,
    generation: Vec<u64>,
}

impl AsyncTable {
    pub fn new(cores: usize) -> Self {
        Self {
            by_fd: HashMap::with_capacity(cores),
            timeouts: BinaryHeap::with_capacity(cores),
            generation: vec![0; cores],
        }
    }

    pub fn bind_fd(&mut self, fd: RawFd, id: AsyncId) {
        self.by_fd.insert(fd, id);
    }

    pub fn unbind_fd(&mut self, fd: RawFd) -> Option<AsyncId> {
        self.by_fd.remove(&fd)
    }

    pub fn lookup(&self, fd: RawFd) -> Option<AsyncId> {
        self.by_fd.get(&fd).copied()
    }

    /// Arm (or re-arm) the receive timeout of core `id`
    pub fn add_timeout(&mut self, id: AsyncId, deadline: u64) {
        let Some(gen) = self.generation.get_mut(id.as_usize()) else {
            return;
        };
        *gen += 1;
        self.timeouts.push(TimeoutEntry {
            deadline,
            id,
            generation: *gen,
        });
    }

    pub fn cancel_timeout(&mut self, id: AsyncId) {
        if let Some(gen) = self.generation.get_mut(id.as_usize()) {
            *gen += 1;
        }
    }

    fn is_live(&self, entry: &TimeoutEntry) -> bool {
        self.generation.get(entry.id.as_usize()) == Some(&entry.generation)
    }

    /// Pop every live timeout whose deadline is strictly before `now`
    pub fn expired(&mut self, now: u64) -> Vec<AsyncId> {
        let mut out = Vec::new();
        while let Some(top) = self.timeouts.peek().copied() {
            if top.deadline >= now {
                break;
            }
            self.timeouts.pop();
            if self.is_live(&top) {
                self.cancel_timeout(top.id);
                out.push(top.id);
            }
        }
        out
    }

    /// Time until the earliest live timeout may fire
    pub fn next_timeout(&mut self, now: u64) -> Option<Duration> {
        while let Some(top) = self.timeouts.peek().copied() {
            if self.is_live(&top) {
                // Fires once now > deadline
                return Some(Duration::from_secs((top.deadline + 1).saturating_sub(now)));
            }
            self.timeouts.pop();
        }
        None
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Event loop over the async cores of one worker
pub struct AsyncEngine<'a, Q: EventQueue> {
    ctx: &'a WorkerContext,
    queue: Q,
    pool: CorePool,
    free: ArrayQueue<AsyncId>,
    table: AsyncTable,
    /// Listening sockets are out of the queue until a core frees up
    paused: bool,
}

impl<'a, Q: EventQueue> AsyncEngine<'a, Q> {
    /// Allocate every core up front and register the worker's descriptors
    pub fn new(ctx: &'a WorkerContext, queue: Q) -> CoreResult<Self> {
        let config = ctx.config();
        let cores = config.cores();
        let pool = CorePool::new(cores, config.buffer_size, config.hvec_slots, config.post_buffering);
        let free = ArrayQueue::new(cores.max(1));
        for slot in pool.iter() {
            let _ = free.push(slot.id());
        }
        ctx.register_core(&queue, AsyncId::new(0))?;
        info!(worker = ctx.worker_id(), cores, "async engine ready");
        Ok(Self {
            ctx,
            queue,
            pool,
            free,
            table: AsyncTable::new(cores),
            paused: false,
        })
    }

    /// Cores not currently serving a request
    pub fn idle_cores(&self) -> usize {
        self.free.len()
    }

    pub fn table(&self) -> &AsyncTable {
        &self.table
    }

    /// Run until the worker stops
    pub fn run(&mut self) -> CoreResult<()> {
        while !self.ctx.should_stop() {
            self.run_once()?;
        }
        Ok(())
    }

    /// One loop iteration: expire, wait, then handle the ready descriptor
    pub fn run_once(&mut self) -> CoreResult<()> {
        let ctx = self.ctx;
        let now = ctx.clock().now_secs();
        for id in self.table.expired(now) {
            warn!(worker = ctx.worker_id(), core = %id, "async receive timed out");
            self.abort(id);
        }

        let mut timeout = self.table.next_timeout(now);
        if let Some(hb) = ctx.supervisor().and_then(|s| s.heartbeat_interval()) {
            timeout = Some(timeout.map_or(hb, |t| t.min(hb)));
        }

        let ready = self.queue.wait(timeout)?;

        if let Some(sup) = ctx.supervisor() {
            sup.heartbeat(ctx.clock().now_secs());
        }

        let Some(fd) = ready else {
            return Ok(());
        };

        if ctx.signals().owns(fd) {
            if let Err(e) = ctx.signals().receive(fd, ctx.worker_id()) {
                warn!(worker = ctx.worker_id(), fd, error = %e, "signal receive failed");
            }
            return Ok(());
        }

        if let Some(index) = ctx.socket_index(fd) {
            return self.accept_on(index, fd);
        }

        if let Some(id) = self.table.unbind_fd(fd) {
            return self.resume(id, fd);
        }

        debug!(worker = ctx.worker_id(), fd, "event for unknown descriptor");
        Ok(())
    }

    fn accept_on(&mut self, index: usize, fd: RawFd) -> CoreResult<()> {
        let ctx = self.ctx;
        let Some(id) = self.free.pop() else {
            debug!(worker = ctx.worker_id(), "no idle async core");
            self.pause_accepting();
            return Ok(());
        };
        let Ok(slot) = self.pool.get_mut(id) else {
            return Ok(());
        };
        setup_request(ctx, slot, Some(index));

        if let Err(e) = simple_accept(ctx, slot, index, fd) {
            debug!(worker = ctx.worker_id(), core = %id, error = %e, "accept failed");
            slot.request.reset();
            self.release(id);
            return Ok(());
        }

        // Edge-triggered sockets deliver the whole request at accept time
        if ctx.sockets()[index].is_edge_triggered() {
            slot.request.do_not_add_to_async_queue = true;
        }

        if let Err(e) = receive_request_async(ctx, &self.queue, &mut self.table, slot) {
            debug!(worker = ctx.worker_id(), core = %id, error = %e, "async receive failed");
            destroy_request(ctx, slot, None);
            self.release(id);
            return Ok(());
        }

        if slot.request.do_not_add_to_async_queue {
            self.finish(id);
        }
        if self.free.is_empty() {
            self.pause_accepting();
        }
        Ok(())
    }

    fn resume(&mut self, id: AsyncId, fd: RawFd) -> CoreResult<()> {
        let ctx = self.ctx;
        let Ok(slot) = self.pool.get_mut(id) else {
            return Ok(());
        };
        let Some(proto) = ctx.protocol_for(&slot.request) else {
            debug!(worker = ctx.worker_id(), core = %id, fd, "request has no socket");
            self.abort(id);
            return Ok(());
        };

        match proto.receive_step(&mut slot.request, &mut slot.buffers) {
            ReceiveStatus::WouldBlock => {
                self.table.bind_fd(fd, id);
            }
            ReceiveStatus::Complete => {
                self.table.cancel_timeout(id);
                if let Err(e) = self.queue.remove(fd) {
                    debug!(fd, error = %e, "unable to unregister descriptor");
                }
                self.finish(id);
            }
            ReceiveStatus::Error => {
                debug!(worker = ctx.worker_id(), core = %id, fd, "async receive error");
                self.abort(id);
            }
        }
        Ok(())
    }

    /// Dispatch and tear down a fully received request
    fn finish(&mut self, id: AsyncId) {
        let ctx = self.ctx;
        let Ok(slot) = self.pool.get_mut(id) else {
            return;
        };
        if let Err(e) = dispatch_request(ctx, slot) {
            warn!(worker = ctx.worker_id(), core = %id, error = %e, "dispatch failed");
        }
        close_request(ctx, slot, None);
        self.release(id);
    }

    /// Drop a request that will not complete
    fn abort(&mut self, id: AsyncId) {
        let ctx = self.ctx;
        self.table.cancel_timeout(id);
        let Ok(slot) = self.pool.get_mut(id) else {
            return;
        };
        if let Some(fd) = slot.request.fd {
            self.table.unbind_fd(fd);
            if let Err(e) = self.queue.remove(fd) {
                debug!(fd, error = %e, "unable to unregister descriptor");
            }
        }
        destroy_request(ctx, slot, None);
        self.release(id);
    }

    /// Return a core to the free queue; accepting resumes if it was paused
    fn release(&mut self, id: AsyncId) {
        let _ = self.free.push(id);
        if self.paused {
            self.resume_accepting();
        }
    }

    /// Stop watching the listening sockets while no core is free
    fn pause_accepting(&mut self) {
        if self.paused {
            return;
        }
        for sock in self.ctx.sockets() {
            for fd in sock.watch_fds(AsyncId::new(0)) {
                if let Err(e) = self.queue.remove(fd) {
                    debug!(fd, error = %e, "unable to pause listening socket");
                }
            }
        }
        self.paused = true;
        debug!(worker = self.ctx.worker_id(), "all async cores busy, accept paused");
    }

    fn resume_accepting(&mut self) {
        for sock in self.ctx.sockets() {
            for fd in sock.watch_fds(AsyncId::new(0)) {
                if let Err(e) = self.queue.add_read(fd) {
                    warn!(fd, error = %e, "unable to resume listening socket");
                }
            }
        }
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::test_support::{HarnessBuilder, MockProtocol, ScriptedQueue};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_table_lazy_cancellation() {
        let mut table = AsyncTable::new(3);
        table.add_timeout(AsyncId::new(0), 10);
        table.add_timeout(AsyncId::new(1), 12);
        table.add_timeout(AsyncId::new(2), 11);
        table.cancel_timeout(AsyncId::new(0));
        // Re-arming supersedes the earlier entry
        table.add_timeout(AsyncId::new(2), 20);

        assert_eq!(table.next_timeout(5), Some(Duration::from_secs(8)));
        assert!(table.expired(12).is_empty());
        assert_eq!(table.expired(13), vec![AsyncId::new(1)]);
        assert_eq!(table.expired(100), vec![AsyncId::new(2)]);
        assert_eq!(table.next_timeout(100), None);
    }

    #[test]
    fn test_fd_index() {
        let mut table = AsyncTable::new(2);
        table.bind_fd(40, AsyncId::new(1));
        assert_eq!(table.lookup(40), Some(AsyncId::new(1)));
        assert_eq!(table.unbind_fd(40), Some(AsyncId::new(1)));
        assert_eq!(table.lookup(40), None);
    }

    #[test]
    fn test_accept_then_resume_on_readiness() {
        let (listen, _peer) = UnixStream::pair().unwrap();
        let lfd = listen.as_raw_fd();
        let proto = MockProtocol::scripted(&[ReceiveStatus::WouldBlock]);
        let h = HarnessBuilder::new(ServerConfig::new().async_cores(2))
            .listen_fd(lfd)
            .protocol(proto)
            .build();
        let queue = ScriptedQueue::with_results(&[Some(lfd)]);
        let mut engine = AsyncEngine::new(&h.ctx, queue).unwrap();
        assert_eq!(engine.idle_cores(), 2);

        // Accept registers the connection and returns without dispatching
        engine.run_once().unwrap();
        assert_eq!(engine.idle_cores(), 1);
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 0);
        let conn = *engine.queue.added.lock().unwrap().last().unwrap();
        assert_eq!(engine.table().lookup(conn), Some(AsyncId::new(0)));

        // First readiness: protocol still wants more
        engine.queue.results.lock().unwrap().push_back(Some(conn));
        engine.run_once().unwrap();
        assert_eq!(engine.table().lookup(conn), Some(AsyncId::new(0)));

        // Second readiness completes the request
        engine.queue.results.lock().unwrap().push_back(Some(conn));
        engine.run_once().unwrap();
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 1);
        assert_eq!(engine.idle_cores(), 2);
        assert_eq!(*engine.queue.removed.lock().unwrap(), vec![conn]);
        assert_eq!(h.ctx.stats().requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_receive_timeout_releases_core() {
        let (listen, _peer) = UnixStream::pair().unwrap();
        let lfd = listen.as_raw_fd();
        let proto = MockProtocol::scripted(&[ReceiveStatus::WouldBlock]);
        let config = ServerConfig::new().async_cores(1).socket_timeout(4).harakiri(10).master(true);
        let h = HarnessBuilder::new(config)
            .listen_fd(lfd)
            .protocol(proto)
            .now(100)
            .build();
        let queue = ScriptedQueue::with_results(&[Some(lfd)]);
        let mut engine = AsyncEngine::new(&h.ctx, queue).unwrap();

        engine.run_once().unwrap();
        assert_eq!(engine.idle_cores(), 0);
        let waits = engine.queue.waits.lock().unwrap().clone();
        assert_eq!(waits, vec![None]);
        assert_eq!(h.ctx.stats().harakiri.get(), 110);
        assert!(h.ctx.core_stats(AsyncId::new(0)).is_in_request());

        h.clock.set_secs(105);
        engine.run_once().unwrap();
        assert_eq!(engine.idle_cores(), 1);
        assert_eq!(h.proto.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 0);
        assert_eq!(h.ctx.stats().requests.load(Ordering::Relaxed), 0);

        // The core is idle again: no live watchdog, no phantom request
        assert!(!h.ctx.stats().harakiri.is_armed());
        assert!(!h.ctx.core_stats(AsyncId::new(0)).is_in_request());
        let slot = engine.pool.get(AsyncId::new(0)).unwrap();
        assert!(slot.request.is_pristine());
        assert!(slot.buffers.hvec.is_empty());
    }

    #[test]
    fn test_full_pool_pauses_accept() {
        let (listen, _peer) = UnixStream::pair().unwrap();
        let lfd = listen.as_raw_fd();
        let proto = MockProtocol::scripted(&[ReceiveStatus::WouldBlock]);
        let h = HarnessBuilder::new(ServerConfig::new().async_cores(1))
            .listen_fd(lfd)
            .protocol(proto)
            .build();
        let queue = ScriptedQueue::with_results(&[Some(lfd), Some(lfd)]);
        let mut engine = AsyncEngine::new(&h.ctx, queue).unwrap();

        // The only core takes the connection; the listener leaves the queue
        engine.run_once().unwrap();
        assert_eq!(engine.idle_cores(), 0);
        assert_eq!(*engine.queue.removed.lock().unwrap(), vec![lfd]);
        let conn = *engine.queue.added.lock().unwrap().last().unwrap();

        // A readiness event already in flight is not accepted
        engine.run_once().unwrap();
        assert_eq!(h.proto.accepts.load(Ordering::SeqCst), 1);
        assert_eq!(*engine.queue.removed.lock().unwrap(), vec![lfd]);

        // Finishing the request puts the listener back
        engine.queue.results.lock().unwrap().push_back(Some(conn));
        engine.run_once().unwrap();
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 1);
        assert_eq!(engine.idle_cores(), 1);
        assert_eq!(*engine.queue.added.lock().unwrap(), vec![lfd, conn, lfd]);
    }

    #[test]
    fn test_failed_deregistration_still_finishes() {
        let (listen, _peer) = UnixStream::pair().unwrap();
        let lfd = listen.as_raw_fd();
        let proto = MockProtocol::scripted(&[ReceiveStatus::WouldBlock]);
        let h = HarnessBuilder::new(ServerConfig::new().async_cores(2))
            .listen_fd(lfd)
            .protocol(proto)
            .build();
        let queue = ScriptedQueue::with_results(&[Some(lfd)]);
        let mut engine = AsyncEngine::new(&h.ctx, queue).unwrap();

        engine.run_once().unwrap();
        let conn = *engine.queue.added.lock().unwrap().last().unwrap();
        engine.queue.fail_remove.store(true, Ordering::SeqCst);

        engine.queue.results.lock().unwrap().push_back(Some(conn));
        assert!(engine.run_once().is_ok());
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 1);
        assert_eq!(engine.idle_cores(), 2);
        assert_eq!(h.ctx.stats().requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_edge_triggered_dispatches_immediately() {
        let (listen, _peer) = UnixStream::pair().unwrap();
        let lfd = listen.as_raw_fd();
        let h = HarnessBuilder::new(ServerConfig::new().async_cores(1))
            .listen_fd(lfd)
            .edge_triggered()
            .build();
        let queue = ScriptedQueue::with_results(&[Some(lfd)]);
        let mut engine = AsyncEngine::new(&h.ctx, queue).unwrap();

        engine.run_once().unwrap();
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 1);
        assert_eq!(engine.idle_cores(), 1);
        assert_eq!(*engine.queue.added.lock().unwrap(), vec![lfd]);
    }
}
