//! Logging setup
//!
//! All crates log through `tracing`. Binaries call [`init_logging`] once;
//! the filter comes from `VASSAL_LOG`, then `RUST_LOG`, then `info`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when no environment override is present
pub const DEFAULT_FILTER: &str = "info";

fn filter_from_env() -> EnvFilter {
    std::env::var("VASSAL_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the stderr subscriber; returns false if one was already set
pub fn init_logging() -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter_from_env())
        .try_init()
        .is_ok()
}
