//! Error types for the request-serving core

use thiserror::Error;
use crate::id::AsyncId;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while accepting, receiving or tearing down requests
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The accept window produced no request (timeout, signal, or no
    /// matching socket). Callers simply loop.
    #[error("no request accepted")]
    NoRequest,

    /// The protocol's accept primitive failed
    #[error("accept failed: errno {0}")]
    Accept(i32),

    /// A protocol receive or write step reported a hard error
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The peer closed the connection before the request was complete
    #[error("peer closed the connection")]
    PeerClosed,

    /// Waiting for readability exceeded the socket timeout
    #[error("timed out waiting for the peer")]
    Timeout,

    /// Event queue creation, registration or wait failed
    #[error("event queue error: errno {0}")]
    EventQueue(i32),

    /// Any other system call failure
    #[error("os error: errno {0}")]
    Os(i32),

    /// Shared memory mapping failed
    #[error("memory mapping failed: errno {0}")]
    Memory(i32),

    /// An async id outside the pool was referenced
    #[error("core {0} is out of range")]
    SlotOutOfRange(AsyncId),

    /// The operation needs a master process supervising the worker
    #[error("operation requires the master process")]
    MasterRequired,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl CoreError {
    /// Build an `Os` error from the calling thread's errno
    pub fn last_os_error() -> Self {
        CoreError::Os(last_errno())
    }

    /// True if the error is the benign "nothing happened" outcome
    #[inline]
    pub fn is_no_request(&self) -> bool {
        matches!(self, CoreError::NoRequest)
    }
}

/// errno of the last failed system call on this thread
#[inline]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Os(e.raw_os_error().unwrap_or(0))
    }
}
