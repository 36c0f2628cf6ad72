//! Environment variable helpers
//!
//! Every tunable of the server can be overridden through a `VASSAL_*`
//! variable. Unset or unparsable values fall back to the supplied default.
//!
//! ```ignore
//! use vassal_core::env::{env_get, env_get_bool, env_get_list};
//!
//! let workers: usize = env_get("VASSAL_WORKERS", 4);
//! let master = env_get_bool("VASSAL_MASTER", true);
//! let listen = env_get_list("VASSAL_LISTEN", &["127.0.0.1:3031"]);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and valid
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" are true, anything else set is false
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Comma-separated list; empty items are dropped
pub fn env_get_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(val) => val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_owned()).collect(),
    }
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
