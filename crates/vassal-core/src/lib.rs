//! # vassal-core
//!
//! Core types and traits for the vassal request-serving core.
//!
//! This crate is platform-agnostic and performs no system calls of its own.
//! Everything that touches descriptors, signals or shared memory lives in
//! `vassal-runtime` behind the traits defined here.
//!
//! ## Modules
//!
//! - `id` - Async core identifier
//! - `error` - Error types
//! - `clock` - Wall clock abstraction (seconds / microseconds)
//! - `stats` - Shared per-worker and per-core statistics records (repr(C))
//! - `harakiri` - Watchdog deadlines and arm/extend/disarm semantics
//! - `request` - Request slot, core buffers and the dispatch context
//! - `pool` - Preallocated core slot pool
//! - `cancel` - Per-thread cooperative cancellation state
//! - `traits` - Collaborator traits (protocol, application, event queue, ...)
//! - `env` - Environment variable utilities

pub mod id;
pub mod error;
pub mod clock;
pub mod stats;
pub mod harakiri;
pub mod request;
pub mod pool;
pub mod cancel;
pub mod traits;
pub mod env;

// Re-exports for convenience
pub use id::AsyncId;
pub use error::{last_errno, CoreError, CoreResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use stats::{AuxStats, CoreStats, WorkerStats};
pub use harakiri::{AlarmFallback, Deadline, HarakiriKind, Watchdog};
pub use request::{cgi_var_name, BufferBinding, CoreBuffers, HeaderVec, LogVar, Request, RequestContext, UploadState};
pub use pool::{CorePool, CoreSlot};
pub use cancel::{CancelDisabled, CancelState};
pub use traits::{
    Application, EventQueue, Protocol, ReceiveStatus, SupervisorLink, ThunderLock,
    ThunderGuard, Transformation,
};
pub use env::{env_get, env_get_bool, env_get_list, env_get_opt, env_get_str, env_is_set};

/// Constants shared by every layer of the server
pub mod constants {
    /// Byte written to the supervisor on every heartbeat
    pub const HEARTBEAT_BYTE: u8 = 26;

    /// Byte written to the supervisor once the worker has served a request
    pub const LOYALTY_BYTE: u8 = 17;

    /// Default size of each core's raw request buffer
    pub const DEFAULT_BUFFER_SIZE: usize = 4096;

    /// Parsed header slots preallocated per core
    pub const DEFAULT_HVEC_SLOTS: usize = 64;

    /// Upper bound on cores (threads or async slots) per worker
    pub const MAX_CORES: usize = 65536;

    /// Cache line size for alignment of shared records
    pub const CACHE_LINE_SIZE: usize = 64;
}
