//! Server configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder calls made by the embedding program
//! 2. Environment variables (`VASSAL_*`)
//! 3. Library defaults
//!
//! ```rust,ignore
//! use vassal_runtime::config::ServerConfig;
//!
//! let config = ServerConfig::from_env()
//!     .workers(4)
//!     .harakiri(30);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;
use thiserror::Error;
use tracing::info;
use vassal_core::constants::MAX_CORES;
use vassal_core::env::{env_get, env_get_bool, env_get_list, env_get_opt};
use vassal_core::CoreError;

const MIB: u64 = 1024 * 1024;

/// Megabytes to bytes; overflow saturates so validation can reject it
fn mib_to_bytes(mib: u64) -> u64 {
    mib.checked_mul(MIB).unwrap_or(u64::MAX)
}

/// Server configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker processes
    pub workers: usize,
    /// Threads per worker (synchronous mode)
    pub threads: usize,
    /// Async cores per worker; 0 selects synchronous mode
    pub async_cores: usize,
    /// Listening addresses (`host:port` or a filesystem path)
    pub listen: Vec<String>,
    pub listen_backlog: i32,
    /// Per-core request header buffer
    pub buffer_size: usize,
    /// Parsed header slots per core
    pub hvec_slots: usize,
    /// Per-core body staging buffer; 0 disables
    pub post_buffering: usize,
    /// Request watchdog in seconds; 0 disables
    pub harakiri: u64,
    /// Seconds to wait for a slow peer
    pub socket_timeout: u64,
    /// Retire after this many requests; 0 disables
    pub max_requests: u64,
    /// Seconds a worker must live before any self-retirement
    pub min_worker_lifetime: u64,
    /// Address space limit in bytes; 0 disables
    pub reload_on_as: u64,
    /// Resident set limit in bytes; 0 disables
    pub reload_on_rss: u64,
    pub memory_report: bool,
    pub force_memusage: bool,
    /// Reap stray children after each request
    pub reaper: bool,
    /// A master process supervises the workers
    pub master: bool,
    /// Heartbeat interval in seconds; 0 disables
    pub heartbeat: u64,
    /// Descriptor connected to the supervising parent
    pub emperor_fd: Option<i32>,
    pub thunder_lock: bool,
    pub close_on_exec: bool,
    pub tcp_nodelay: bool,
    /// Polling interval while suspended
    pub suspend_poll: Duration,
    /// Watchdog scan interval of the master
    pub monitor_interval: Duration,
    pub mules: usize,
    pub spoolers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Defaults with `VASSAL_*` environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `VASSAL_WORKERS`, `VASSAL_THREADS`, `VASSAL_ASYNC`
    /// - `VASSAL_LISTEN` - comma-separated addresses
    /// - `VASSAL_LISTEN_BACKLOG`, `VASSAL_BUFFER_SIZE`, `VASSAL_POST_BUFFERING`
    /// - `VASSAL_HARAKIRI`, `VASSAL_SOCKET_TIMEOUT` - seconds
    /// - `VASSAL_MAX_REQUESTS`, `VASSAL_MIN_WORKER_LIFETIME`
    /// - `VASSAL_RELOAD_ON_AS`, `VASSAL_RELOAD_ON_RSS` - MiB
    /// - `VASSAL_MEMORY_REPORT`, `VASSAL_FORCE_MEMUSAGE`, `VASSAL_REAPER`, `VASSAL_MASTER`
    /// - `VASSAL_HEARTBEAT` - seconds
    /// - `VASSAL_EMPEROR_FD`
    /// - `VASSAL_THUNDER_LOCK`, `VASSAL_CLOSE_ON_EXEC`, `VASSAL_TCP_NODELAY`
    /// - `VASSAL_SUSPEND_POLL_MS`, `VASSAL_MONITOR_INTERVAL_MS`
    /// - `VASSAL_MULES`, `VASSAL_SPOOLERS`
    pub fn from_env() -> Self {
        Self {
            workers: env_get("VASSAL_WORKERS", defaults::WORKERS),
            threads: env_get("VASSAL_THREADS", defaults::THREADS),
            async_cores: env_get("VASSAL_ASYNC", defaults::ASYNC_CORES),
            listen: env_get_list("VASSAL_LISTEN", &[defaults::LISTEN]),
            listen_backlog: env_get("VASSAL_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            buffer_size: env_get("VASSAL_BUFFER_SIZE", defaults::BUFFER_SIZE),
            hvec_slots: env_get("VASSAL_HVEC_SLOTS", defaults::HVEC_SLOTS),
            post_buffering: env_get("VASSAL_POST_BUFFERING", defaults::POST_BUFFERING),
            harakiri: env_get("VASSAL_HARAKIRI", defaults::HARAKIRI),
            socket_timeout: env_get("VASSAL_SOCKET_TIMEOUT", defaults::SOCKET_TIMEOUT),
            max_requests: env_get("VASSAL_MAX_REQUESTS", defaults::MAX_REQUESTS),
            min_worker_lifetime: env_get(
                "VASSAL_MIN_WORKER_LIFETIME",
                defaults::MIN_WORKER_LIFETIME,
            ),
            reload_on_as: mib_to_bytes(env_get("VASSAL_RELOAD_ON_AS", defaults::RELOAD_ON_AS)),
            reload_on_rss: mib_to_bytes(env_get("VASSAL_RELOAD_ON_RSS", defaults::RELOAD_ON_RSS)),
            memory_report: env_get_bool("VASSAL_MEMORY_REPORT", defaults::MEMORY_REPORT),
            force_memusage: env_get_bool("VASSAL_FORCE_MEMUSAGE", defaults::FORCE_MEMUSAGE),
            reaper: env_get_bool("VASSAL_REAPER", defaults::REAPER),
            master: env_get_bool("VASSAL_MASTER", defaults::MASTER),
            heartbeat: env_get("VASSAL_HEARTBEAT", defaults::HEARTBEAT),
            emperor_fd: env_get_opt("VASSAL_EMPEROR_FD"),
            thunder_lock: env_get_bool("VASSAL_THUNDER_LOCK", defaults::THUNDER_LOCK),
            close_on_exec: env_get_bool("VASSAL_CLOSE_ON_EXEC", defaults::CLOSE_ON_EXEC),
            tcp_nodelay: env_get_bool("VASSAL_TCP_NODELAY", defaults::TCP_NODELAY),
            suspend_poll: Duration::from_millis(env_get(
                "VASSAL_SUSPEND_POLL_MS",
                defaults::SUSPEND_POLL_MS,
            )),
            monitor_interval: Duration::from_millis(env_get(
                "VASSAL_MONITOR_INTERVAL_MS",
                defaults::MONITOR_INTERVAL_MS,
            )),
            mules: env_get("VASSAL_MULES", defaults::MULES),
            spoolers: env_get("VASSAL_SPOOLERS", defaults::SPOOLERS),
        }
    }

    /// Library defaults only, ignoring the environment
    pub fn new() -> Self {
        Self {
            workers: defaults::WORKERS,
            threads: defaults::THREADS,
            async_cores: defaults::ASYNC_CORES,
            listen: vec![defaults::LISTEN.to_owned()],
            listen_backlog: defaults::LISTEN_BACKLOG,
            buffer_size: defaults::BUFFER_SIZE,
            hvec_slots: defaults::HVEC_SLOTS,
            post_buffering: defaults::POST_BUFFERING,
            harakiri: defaults::HARAKIRI,
            socket_timeout: defaults::SOCKET_TIMEOUT,
            max_requests: defaults::MAX_REQUESTS,
            min_worker_lifetime: defaults::MIN_WORKER_LIFETIME,
            reload_on_as: mib_to_bytes(defaults::RELOAD_ON_AS),
            reload_on_rss: mib_to_bytes(defaults::RELOAD_ON_RSS),
            memory_report: defaults::MEMORY_REPORT,
            force_memusage: defaults::FORCE_MEMUSAGE,
            reaper: defaults::REAPER,
            master: defaults::MASTER,
            heartbeat: defaults::HEARTBEAT,
            emperor_fd: None,
            thunder_lock: defaults::THUNDER_LOCK,
            close_on_exec: defaults::CLOSE_ON_EXEC,
            tcp_nodelay: defaults::TCP_NODELAY,
            suspend_poll: Duration::from_millis(defaults::SUSPEND_POLL_MS),
            monitor_interval: Duration::from_millis(defaults::MONITOR_INTERVAL_MS),
            mules: defaults::MULES,
            spoolers: defaults::SPOOLERS,
        }
    }

    /// Cores per worker: async slots in async mode, threads otherwise
    #[inline]
    pub fn cores(&self) -> usize {
        if self.async_cores > 0 {
            self.async_cores
        } else {
            self.threads
        }
    }

    #[inline]
    pub fn is_async(&self) -> bool {
        self.async_cores > 0
    }

    /// Memory must be sampled after each request
    #[inline]
    pub fn samples_memory(&self) -> bool {
        self.memory_report || self.force_memusage || self.reload_on_as > 0 || self.reload_on_rss > 0
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn async_cores(mut self, n: usize) -> Self {
        self.async_cores = n;
        self
    }

    pub fn listen(mut self, addrs: Vec<String>) -> Self {
        self.listen = addrs;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn post_buffering(mut self, size: usize) -> Self {
        self.post_buffering = size;
        self
    }

    pub fn harakiri(mut self, secs: u64) -> Self {
        self.harakiri = secs;
        self
    }

    pub fn socket_timeout(mut self, secs: u64) -> Self {
        self.socket_timeout = secs;
        self
    }

    pub fn max_requests(mut self, n: u64) -> Self {
        self.max_requests = n;
        self
    }

    pub fn min_worker_lifetime(mut self, secs: u64) -> Self {
        self.min_worker_lifetime = secs;
        self
    }

    /// Address space limit in bytes
    pub fn reload_on_as(mut self, bytes: u64) -> Self {
        self.reload_on_as = bytes;
        self
    }

    /// Resident set limit in bytes
    pub fn reload_on_rss(mut self, bytes: u64) -> Self {
        self.reload_on_rss = bytes;
        self
    }

    pub fn memory_report(mut self, enable: bool) -> Self {
        self.memory_report = enable;
        self
    }

    pub fn reaper(mut self, enable: bool) -> Self {
        self.reaper = enable;
        self
    }

    pub fn master(mut self, enable: bool) -> Self {
        self.master = enable;
        self
    }

    pub fn heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat = secs;
        self
    }

    pub fn emperor_fd(mut self, fd: Option<i32>) -> Self {
        self.emperor_fd = fd;
        self
    }

    pub fn thunder_lock(mut self, enable: bool) -> Self {
        self.thunder_lock = enable;
        self
    }

    pub fn close_on_exec(mut self, enable: bool) -> Self {
        self.close_on_exec = enable;
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn suspend_poll(mut self, d: Duration) -> Self {
        self.suspend_poll = d;
        self
    }

    pub fn monitor_interval(mut self, d: Duration) -> Self {
        self.monitor_interval = d;
        self
    }

    pub fn mules(mut self, n: usize) -> Self {
        self.mules = n;
        self
    }

    pub fn spoolers(mut self, n: usize) -> Self {
        self.spoolers = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue("workers must be > 0"));
        }
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.cores() > MAX_CORES {
            return Err(ConfigError::InvalidValue("cores per worker must be <= 65536"));
        }
        if self.buffer_size < 1024 {
            return Err(ConfigError::InvalidValue("buffer_size must be >= 1024"));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::InvalidValue("at least one listen address is required"));
        }
        if self.heartbeat > 0 && self.emperor_fd.is_none() {
            return Err(ConfigError::InvalidValue("heartbeat requires an emperor fd"));
        }
        if self.workers > 1 && !self.master {
            return Err(ConfigError::InvalidValue("multiple workers require the master"));
        }
        if self.reload_on_as == u64::MAX {
            return Err(ConfigError::InvalidValue("reload_on_as is too large"));
        }
        if self.reload_on_rss == u64::MAX {
            return Err(ConfigError::InvalidValue("reload_on_rss is too large"));
        }
        Ok(())
    }

    /// Log the effective configuration
    pub fn log_summary(&self) {
        info!(
            workers = self.workers,
            threads = self.threads,
            async_cores = self.async_cores,
            listen = ?self.listen,
            buffer_size = self.buffer_size,
            harakiri = self.harakiri,
            socket_timeout = self.socket_timeout,
            max_requests = self.max_requests,
            master = self.master,
            heartbeat = self.heartbeat,
            thunder_lock = self.thunder_lock,
            "server configuration"
        );
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidValue(&'static str),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => CoreError::Config(msg),
        }
    }
}
