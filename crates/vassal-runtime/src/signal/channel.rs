//! Server signal channel
//!
//! Each worker may own up to two signal descriptors (the worker-wide one
//! and a per-worker one). A readable byte on either is a signal number in
//! 0..=255, dispatched to the handler registered for it.

use std::os::fd::RawFd;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use vassal_core::{last_errno, CoreError, CoreResult};

pub type SignalHandler = Arc<dyn Fn(u8) + Send + Sync>;

/// Handlers indexed by signal number
pub struct SignalTable {
    handlers: RwLock<Vec<Option<SignalHandler>>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(vec![None; 256]),
        }
    }

    pub fn register(&self, sig: u8, handler: SignalHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers[sig as usize] = Some(handler);
    }

    /// Run the handler for `sig`; false when none is registered
    pub fn dispatch(&self, sig: u8) -> bool {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers[sig as usize].clone()
        };
        match handler {
            Some(h) => {
                h(sig);
                true
            }
            None => false,
        }
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The signal descriptors a worker listens on
#[derive(Clone)]
pub struct SignalChannel {
    fds: Vec<RawFd>,
    table: Arc<SignalTable>,
}

impl SignalChannel {
    pub fn new(fds: Vec<RawFd>, table: Arc<SignalTable>) -> Self {
        Self { fds, table }
    }

    /// A channel with no descriptors
    pub fn none() -> Self {
        Self::new(Vec::new(), Arc::new(SignalTable::new()))
    }

    #[inline]
    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }

    #[inline]
    pub fn owns(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn table(&self) -> &Arc<SignalTable> {
        &self.table
    }

    /// Read one signal byte from `fd` and dispatch it
    pub fn receive(&self, fd: RawFd, worker_id: usize) -> CoreResult<u8> {
        let mut byte = 0u8;
        let n = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n < 0 {
            return Err(CoreError::Os(last_errno()));
        }
        if n == 0 {
            warn!(worker = worker_id, fd, "signal channel closed");
            return Err(CoreError::PeerClosed);
        }
        info!(worker = worker_id, signum = byte, "signal received");
        if !self.table.dispatch(byte) {
            warn!(worker = worker_id, signum = byte, "no handler for signal");
        }
        Ok(byte)
    }
}
