//! Compile-time configuration defaults

/// Worker processes forked by the master
pub const WORKERS: usize = 1;

/// Threads (cores) per worker in synchronous mode
pub const THREADS: usize = 1;

/// Async cores per worker; 0 selects synchronous mode
pub const ASYNC_CORES: usize = 0;

pub const LISTEN: &str = "127.0.0.1:3031";
pub const LISTEN_BACKLOG: i32 = 100;

pub const BUFFER_SIZE: usize = vassal_core::constants::DEFAULT_BUFFER_SIZE;
pub const HVEC_SLOTS: usize = vassal_core::constants::DEFAULT_HVEC_SLOTS;
pub const POST_BUFFERING: usize = 0;

/// Seconds; 0 disables the request watchdog
pub const HARAKIRI: u64 = 0;
pub const SOCKET_TIMEOUT: u64 = 4;

pub const MAX_REQUESTS: u64 = 0;
pub const MIN_WORKER_LIFETIME: u64 = 60;
/// MiB; 0 disables
pub const RELOAD_ON_AS: u64 = 0;
/// MiB; 0 disables
pub const RELOAD_ON_RSS: u64 = 0;

pub const MEMORY_REPORT: bool = false;
pub const FORCE_MEMUSAGE: bool = false;
pub const REAPER: bool = false;
pub const MASTER: bool = true;

/// Seconds; 0 disables heartbeats
pub const HEARTBEAT: u64 = 0;

pub const THUNDER_LOCK: bool = true;
pub const CLOSE_ON_EXEC: bool = true;
pub const TCP_NODELAY: bool = false;

pub const SUSPEND_POLL_MS: u64 = 10_000;
pub const MONITOR_INTERVAL_MS: u64 = 1_000;

pub const MULES: usize = 0;
pub const SPOOLERS: usize = 0;
