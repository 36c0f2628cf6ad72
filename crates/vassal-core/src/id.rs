//! Async core identifier

use core::fmt;

/// Index of a core inside a worker.
///
/// In threaded mode every thread owns exactly one core; in async mode a
/// single thread multiplexes many. The id survives request teardown: it is
/// the only field of a request slot that is never zeroed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct AsyncId(u32);

impl AsyncId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        AsyncId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing per-core tables
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for AsyncId {
    #[inline]
    fn from(id: u32) -> Self {
        AsyncId(id)
    }
}

impl From<AsyncId> for u32 {
    #[inline]
    fn from(id: AsyncId) -> Self {
        id.0
    }
}

impl fmt::Debug for AsyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncId({})", self.0)
    }
}

impl fmt::Display for AsyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
