//! Portable accept lock: spin on the shared word, yielding between attempts
//!
//! The word holds the owner's pid (0 = unlocked). A waiter that finds the
//! owner process gone takes the lock over.

use std::sync::atomic::{AtomicI32, Ordering};

use tracing::warn;
use vassal_core::{CoreResult, ThunderLock};

use super::LockWord;

/// Lock word, placed in the shared table or on the heap
#[repr(C)]
pub struct RawLock {
    owner: AtomicI32,
}

impl RawLock {
    /// Reset the word at `this` to unlocked.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory that no thread or process is
    /// using as a lock yet.
    pub(crate) unsafe fn init(this: *mut RawLock) -> CoreResult<()> {
        this.write(RawLock { owner: AtomicI32::new(0) });
        Ok(())
    }

    pub(crate) fn boxed() -> Box<RawLock> {
        Box::new(RawLock { owner: AtomicI32::new(0) })
    }
}

fn process_gone(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    rc < 0 && vassal_core::last_errno() == libc::ESRCH
}

pub struct SpinThunderLock {
    word: LockWord,
}

impl SpinThunderLock {
    pub(super) fn with_word(word: LockWord) -> Self {
        Self { word }
    }
}

impl ThunderLock for SpinThunderLock {
    fn lock(&self) {
        let owner = &self.word.get().owner;
        let me = std::process::id() as i32;
        loop {
            match owner.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return,
                Err(holder) if holder != 0 && holder != me && process_gone(holder) => {
                    if owner
                        .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        warn!(pid = holder, "thunder lock holder died, recovering the lock");
                        return;
                    }
                }
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    fn unlock(&self) {
        self.word.get().owner.store(0, Ordering::Release);
    }
}
