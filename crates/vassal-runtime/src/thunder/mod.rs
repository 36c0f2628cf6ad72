//! Thundering-herd lock
//!
//! Serializes the accept window across every thread of every worker process
//! sharing a listening socket: only the holder waits for readiness, so one
//! incoming connection wakes exactly one waiter.
//!
//! The lock lives either in the shared process table (cross-process) or in
//! private memory (threads of a single process). A holder that dies inside
//! the window does not wedge the herd: the next locker recovers the lock.

use std::sync::Arc;

use vassal_core::ThunderLock;
use crate::memory::ProcessTable;

/// Where the lock word lives
pub(crate) enum LockWord {
    Private(Box<RawLock>),
    Shared(Arc<ProcessTable>),
}

impl LockWord {
    #[inline]
    pub(crate) fn get(&self) -> &RawLock {
        match self {
            LockWord::Private(word) => word,
            LockWord::Shared(table) => &table.header().thunder,
        }
    }
}

/// Lock that never blocks, for when the thunder lock is disabled
#[derive(Debug, Default)]
pub struct NoThunderLock;

impl ThunderLock for NoThunderLock {
    fn lock(&self) {}
    fn unlock(&self) {}
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod robust_linux;
        pub use robust_linux::RobustThunderLock as PlatformThunderLock;
        pub(crate) use robust_linux::RawLock;
    } else {
        mod fallback;
        pub use fallback::SpinThunderLock as PlatformThunderLock;
        pub(crate) use fallback::RawLock;
    }
}

impl PlatformThunderLock {
    /// Lock shared by the threads of this process only
    pub fn private() -> Self {
        Self::with_word(LockWord::Private(RawLock::boxed()))
    }

    /// Lock shared by every process mapping `table`
    pub fn shared(table: Arc<ProcessTable>) -> Self {
        Self::with_word(LockWord::Shared(table))
    }
}

/// Build the configured lock
pub fn new_thunder_lock(enabled: bool, table: Option<Arc<ProcessTable>>) -> Arc<dyn ThunderLock> {
    match (enabled, table) {
        (false, _) => Arc::new(NoThunderLock),
        (true, Some(table)) => Arc::new(PlatformThunderLock::shared(table)),
        (true, None) => Arc::new(PlatformThunderLock::private()),
    }
}
