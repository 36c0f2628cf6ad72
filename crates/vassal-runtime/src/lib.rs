//! # vassal-runtime
//!
//! Unix runtime for the vassal request-serving core.
//!
//! This crate provides:
//! - Configuration (defaults + `VASSAL_*` environment overrides)
//! - The shared process table (anonymous shared mapping)
//! - The thundering-herd lock (robust pthread mutex on Linux, owner-pid spin lock elsewhere)
//! - Readiness queues (epoll on Linux, poll everywhere)
//! - The request lifecycle: accept, setup/receive, dispatch, teardown
//! - The async engine, the harakiri monitor and the supervisor link
//! - Logging setup

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("vassal-runtime only supports Unix platforms");
    }
}

pub mod config;
pub mod memory;
pub mod thunder;
pub mod event;
pub mod signal;
pub mod io;
pub mod socket;
pub mod proto;
pub mod supervisor;
pub mod worker;
pub mod accept;
pub mod setup;
pub mod teardown;
pub mod async_engine;
pub mod monitor;
pub mod memusage;
pub mod logging;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports
pub use config::{ConfigError, ServerConfig};
pub use memory::ProcessTable;
pub use thunder::{new_thunder_lock, NoThunderLock, PlatformThunderLock};
pub use event::{PlatformEventQueue, PollQueue};
pub use signal::{SignalChannel, SignalHandler, SignalTable};
pub use socket::{bind_listener, ListenSocket};
pub use proto::LineProtocol;
pub use supervisor::{FdLink, Supervisor};
pub use worker::{run_core, RetireReason, WorkerContext, WorkerThreads};
pub use accept::{accept_request, simple_accept};
pub use setup::{dispatch_request, receive_request, receive_request_async, setup_request};
pub use teardown::{close_request, destroy_request, TeardownOutcome};
pub use async_engine::{AsyncEngine, AsyncTable};
pub use monitor::{HarakiriAction, HarakiriEvent, HarakiriMonitor, KillAction, MonitorThread};
pub use memusage::MemoryUsage;
pub use logging::init_logging;
