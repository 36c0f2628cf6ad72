//! Shared process table
//!
//! One anonymous shared mapping, created by the master before forking,
//! holds every record the master and the workers both touch:
//!
//! ```text
//! +-----------------+  offset 0
//! | TableHeader     |  thunder lock
//! +-----------------+
//! | WorkerStats[0]  |  aggregate record
//! | WorkerStats[1]  |  worker 1
//! | ...             |
//! | WorkerStats[W]  |
//! +-----------------+
//! | CoreStats       |  (W + 1) * cores, row-major by worker
//! +-----------------+
//! | AuxStats        |  mules
//! +-----------------+
//! | AuxStats        |  spoolers
//! +-----------------+
//! ```
//!
//! Every record type is cache-line aligned and a multiple of 64 bytes, so
//! the offsets computed here keep each array aligned.

use core::mem::size_of;

use vassal_core::{AuxStats, CoreResult, CoreStats, WorkerStats};

use crate::thunder::RawLock;

#[cfg(unix)]
mod unix;

/// First record of the table
#[repr(C, align(64))]
pub struct TableHeader {
    /// Process-shared accept lock
    pub(crate) thunder: RawLock,
}

/// Array offsets inside the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    workers_off: usize,
    cores_off: usize,
    mules_off: usize,
    spoolers_off: usize,
    total: usize,
}

impl Layout {
    fn compute(workers: usize, cores: usize, mules: usize, spoolers: usize) -> Self {
        let workers_off = size_of::<TableHeader>();
        let cores_off = workers_off + (workers + 1) * size_of::<WorkerStats>();
        let mules_off = cores_off + (workers + 1) * cores * size_of::<CoreStats>();
        let spoolers_off = mules_off + mules * size_of::<AuxStats>();
        let total = spoolers_off + spoolers * size_of::<AuxStats>();
        Self {
            workers_off,
            cores_off,
            mules_off,
            spoolers_off,
            total,
        }
    }
}

/// Shared statistics for the whole server
pub struct ProcessTable {
    base: *mut u8,
    layout: Layout,
    workers: usize,
    cores: usize,
    mules: usize,
    spoolers: usize,
}

// Safety: the mapping only holds atomics and is never moved while mapped
unsafe impl Send for ProcessTable {}
unsafe impl Sync for ProcessTable {}

impl ProcessTable {
    /// Map a zeroed table for `workers` workers of `cores` cores each.
    ///
    /// All-zero bytes are a valid initial state for every stats record;
    /// the header lock is initialized in place.
    pub fn new(workers: usize, cores: usize, mules: usize, spoolers: usize) -> CoreResult<Self> {
        let layout = Layout::compute(workers, cores, mules, spoolers);
        let base = Self::map_shared(layout.total)?;
        // Safety: fresh mapping, nobody else can see it yet
        if let Err(e) = unsafe { RawLock::init(base as *mut RawLock) } {
            Self::unmap_shared(base, layout.total);
            return Err(e);
        }
        Ok(Self {
            base,
            layout,
            workers,
            cores,
            mules,
            spoolers,
        })
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[inline]
    pub fn cores(&self) -> usize {
        self.cores
    }

    #[inline]
    pub fn mules(&self) -> usize {
        self.mules
    }

    #[inline]
    pub fn spoolers(&self) -> usize {
        self.spoolers
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.total
    }

    #[inline]
    pub fn header(&self) -> &TableHeader {
        // Safety: offset 0 is in bounds and aligned by mmap
        unsafe { &*(self.base as *const TableHeader) }
    }

    /// The aggregate record
    #[inline]
    pub fn global(&self) -> &WorkerStats {
        self.worker(0)
    }

    /// Worker record `id` (1-based; 0 is the aggregate)
    ///
    /// Panics if `id > workers()`; see [`get_worker`](Self::get_worker).
    #[inline]
    pub fn worker(&self, id: usize) -> &WorkerStats {
        match self.get_worker(id) {
            Some(record) => record,
            None => panic!("worker {} out of range", id),
        }
    }

    #[inline]
    pub fn get_worker(&self, id: usize) -> Option<&WorkerStats> {
        if id > self.workers {
            return None;
        }
        // Safety: bounds checked above; records are 64-byte aligned
        Some(unsafe {
            &*(self.base.add(self.layout.workers_off + id * size_of::<WorkerStats>())
                as *const WorkerStats)
        })
    }

    /// Core record `core` of worker `id`
    #[inline]
    pub fn core(&self, id: usize, core: usize) -> &CoreStats {
        match self.get_core(id, core) {
            Some(record) => record,
            None => panic!("core {}/{} out of range", id, core),
        }
    }

    #[inline]
    pub fn get_core(&self, id: usize, core: usize) -> Option<&CoreStats> {
        if id > self.workers || core >= self.cores {
            return None;
        }
        let index = id * self.cores + core;
        // Safety: bounds checked above
        Some(unsafe {
            &*(self.base.add(self.layout.cores_off + index * size_of::<CoreStats>())
                as *const CoreStats)
        })
    }

    #[inline]
    pub fn mule(&self, id: usize) -> &AuxStats {
        match self.get_mule(id) {
            Some(record) => record,
            None => panic!("mule {} out of range", id),
        }
    }

    #[inline]
    pub fn get_mule(&self, id: usize) -> Option<&AuxStats> {
        if id >= self.mules {
            return None;
        }
        // Safety: bounds checked above
        Some(unsafe {
            &*(self.base.add(self.layout.mules_off + id * size_of::<AuxStats>()) as *const AuxStats)
        })
    }

    #[inline]
    pub fn spooler(&self, id: usize) -> &AuxStats {
        match self.get_spooler(id) {
            Some(record) => record,
            None => panic!("spooler {} out of range", id),
        }
    }

    #[inline]
    pub fn get_spooler(&self, id: usize) -> Option<&AuxStats> {
        if id >= self.spoolers {
            return None;
        }
        // Safety: bounds checked above
        Some(unsafe {
            &*(self.base.add(self.layout.spoolers_off + id * size_of::<AuxStats>())
                as *const AuxStats)
        })
    }

    /// Worker ids 1..=W whose pid matches
    pub fn find_worker(&self, pid: i32) -> Option<usize> {
        (1..=self.workers).find(|id| self.get_worker(*id).is_some_and(|w| w.pid() == pid))
    }
}

impl Drop for ProcessTable {
    fn drop(&mut self) {
        Self::unmap_shared(self.base, self.layout.total);
    }
}
