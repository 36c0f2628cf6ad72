//! Unix shared mapping using mmap

use super::ProcessTable;
use vassal_core::{last_errno, CoreError, CoreResult};

impl ProcessTable {
    /// Anonymous shared read/write mapping; survives fork in both parent and child
    pub(super) fn map_shared(size: usize) -> CoreResult<*mut u8> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CoreError::Memory(last_errno()));
        }
        Ok(base as *mut u8)
    }

    pub(super) fn unmap_shared(base: *mut u8, size: usize) {
        unsafe {
            libc::munmap(base as *mut libc::c_void, size);
        }
    }
}
