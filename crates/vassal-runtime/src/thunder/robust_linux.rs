//! Linux accept lock: a robust, process-shared pthread mutex
//!
//! A worker can die while holding the lock (harakiri SIGKILL, or a core
//! thread parked in the accept wait when the process exits). The kernel
//! then hands the next locker `EOWNERDEAD`; the mutex is marked consistent
//! again and the new holder carries on.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use tracing::{error, warn};
use vassal_core::{CoreError, CoreResult, ThunderLock};

use super::LockWord;

/// Mutex storage, placed in the shared table or on the heap
#[repr(C)]
pub struct RawLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: the pthread mutex synchronizes its own state
unsafe impl Send for RawLock {}
unsafe impl Sync for RawLock {}

fn check(rc: libc::c_int) -> CoreResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(CoreError::Os(rc))
    }
}

impl RawLock {
    /// Initialize the mutex at `this` as robust and process-shared.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory that no thread or process is
    /// using as a lock yet.
    pub(crate) unsafe fn init(this: *mut RawLock) -> CoreResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let attr = attr.as_mut_ptr();
        let result = check(libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED))
            .and_then(|_| check(libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST)))
            .and_then(|_| check(libc::pthread_mutex_init(UnsafeCell::raw_get(std::ptr::addr_of!((*this).mutex)), attr)));
        libc::pthread_mutexattr_destroy(attr);
        result
    }

    pub(crate) fn boxed() -> Box<RawLock> {
        // All-zero is a valid (non-robust) mutex until init runs
        let mut raw = Box::new(RawLock {
            mutex: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        });
        if let Err(e) = unsafe { RawLock::init(&mut *raw) } {
            warn!(error = %e, "robust thunder lock unavailable, using a plain mutex");
        }
        raw
    }

    #[inline]
    fn as_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.get()
    }
}

pub struct RobustThunderLock {
    word: LockWord,
}

impl RobustThunderLock {
    pub(super) fn with_word(word: LockWord) -> Self {
        Self { word }
    }
}

impl ThunderLock for RobustThunderLock {
    fn lock(&self) {
        let mutex = self.word.get().as_ptr();
        match unsafe { libc::pthread_mutex_lock(mutex) } {
            0 => {}
            libc::EOWNERDEAD => {
                warn!("thunder lock holder died, recovering the lock");
                unsafe {
                    libc::pthread_mutex_consistent(mutex);
                }
            }
            rc => error!(errno = rc, "unable to take the thunder lock"),
        }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.word.get().as_ptr()) };
        if rc != 0 {
            error!(errno = rc, "unable to release the thunder lock");
        }
    }
}
