//! Collaborator traits
//!
//! These traits define the interface between the platform-agnostic request
//! lifecycle and the things it drives: wire protocols, applications, the
//! readiness queue, the supervisor channel and the accept lock.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::CoreResult;
use crate::request::{CoreBuffers, Request, RequestContext};

/// Outcome of one incremental receive step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// The request header is fully buffered
    Complete,
    /// More bytes are needed; wait for readability and call again
    WouldBlock,
    /// Malformed input or a transport failure
    Error,
}

/// Wire protocol adapter bound to a listening socket
pub trait Protocol: Send + Sync {
    /// Accept one connection from `listen_fd`, returning the connection fd.
    ///
    /// Edge-triggered protocols may set `req.retry_requested` when the
    /// listening socket must be revisited without fresh readiness.
    fn accept(&self, req: &mut Request, listen_fd: RawFd) -> CoreResult<RawFd>;

    /// Advance parsing of the request header by one step
    fn receive_step(&self, req: &mut Request, buffers: &mut CoreBuffers) -> ReceiveStatus;

    /// Write response bytes to the connection
    fn write(&self, req: &mut Request, data: &[u8]) -> CoreResult<usize>;

    /// Close the connection
    fn close(&self, req: &mut Request);

    /// Short name for logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// The request handler dispatched between receive and teardown
pub trait Application: Send + Sync {
    /// Handle one request; the return value is stored as the app status
    fn handle(&self, ctx: &mut RequestContext<'_>) -> i32;

    /// Final routing hooks, run after accounting and before the connection closes
    fn after_accounting(&self, _ctx: &mut RequestContext<'_>) {}

    /// Per-request cleanup hook, run after buffers are released
    fn after_request(&self, _ctx: &mut RequestContext<'_>) {}
}

/// Response transformation applied to the buffered body at teardown
pub trait Transformation: Send {
    /// Transform the buffered output; the result feeds the next transformation
    fn finalize(&mut self, input: Vec<u8>) -> CoreResult<Vec<u8>>;
}

/// Readiness multiplexer used by the accept loop and the async engine
pub trait EventQueue: Send + Sync {
    /// Register `fd` for read readiness
    fn add_read(&self, fd: RawFd) -> CoreResult<()>;

    /// Stop watching `fd`
    fn remove(&self, fd: RawFd) -> CoreResult<()>;

    /// Wait for one ready descriptor.
    ///
    /// `None` blocks indefinitely. Returns `Ok(None)` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> CoreResult<Option<RawFd>>;
}

/// One-byte channel to the supervising parent
pub trait SupervisorLink: Send + Sync {
    fn send_byte(&self, byte: u8) -> std::io::Result<()>;
}

/// Cross-process mutual exclusion around the accept window
pub trait ThunderLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);

    /// Lock and return a guard that unlocks on drop
    fn guard(&self) -> ThunderGuard<'_>
    where
        Self: Sized,
    {
        self.lock();
        ThunderGuard { lock: self }
    }
}

/// RAII holder of a [`ThunderLock`]
pub struct ThunderGuard<'a> {
    lock: &'a dyn ThunderLock,
}

impl<'a> ThunderGuard<'a> {
    /// Lock through a trait object
    pub fn acquire(lock: &'a dyn ThunderLock) -> Self {
        lock.lock();
        ThunderGuard { lock }
    }
}

impl Drop for ThunderGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
