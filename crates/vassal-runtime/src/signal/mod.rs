//! Signal handling
//!
//! Two unrelated mechanisms share the name:
//! - process signals (SIGALRM watchdog fallback, SIGKILL from the watchdog
//!   scan, SIGTERM/SIGINT shutdown of the master);
//! - the signal channel, a socket carrying one-byte server signal numbers
//!   that the accept loop dispatches to registered handlers.

mod channel;
pub use channel::{SignalChannel, SignalHandler, SignalTable};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::{
            install_harakiri_handler, install_shutdown_handlers, kill_pid, shutdown_requested,
            SysAlarm,
        };
    }
}
