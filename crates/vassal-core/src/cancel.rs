//! Cooperative thread cancellation
//!
//! In multi-threaded workers a thread may be asked to stop (reload,
//! shutdown). The request only takes effect at points where cancellation is
//! enabled; the accept loop disables it from the moment a descriptor is
//! ready until the request is torn down, so a thread never dies holding a
//! half-claimed connection.

use core::sync::atomic::{AtomicBool, Ordering};

/// Per-thread cancellation state
#[derive(Debug)]
pub struct CancelState {
    enabled: AtomicBool,
    requested: AtomicBool,
}

impl CancelState {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            requested: AtomicBool::new(false),
        }
    }

    /// Ask the owning thread to stop at its next enabled checkpoint
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[inline]
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// A pending request is only observable while enabled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.is_enabled() && self.is_requested()
    }

    /// Disable until the returned guard drops (or is kept)
    pub fn disable_scoped(&self) -> CancelDisabled<'_> {
        self.disable();
        CancelDisabled { state: Some(self) }
    }
}

impl Default for CancelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-enables cancellation when dropped, on every exit path
#[must_use]
pub struct CancelDisabled<'a> {
    state: Option<&'a CancelState>,
}

impl CancelDisabled<'_> {
    /// Leave cancellation disabled past this scope; teardown re-enables it
    pub fn keep(mut self) {
        self.state = None;
    }
}

impl Drop for CancelDisabled<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.state {
            state.enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_deferred_while_disabled() {
        let state = CancelState::new();
        state.disable();
        state.request();
        assert!(!state.is_cancelled());
        state.enable();
        assert!(state.is_cancelled());
    }

    #[test]
    fn test_guard_reenables_on_drop() {
        let state = CancelState::new();
        {
            let _guard = state.disable_scoped();
            assert!(!state.is_enabled());
        }
        assert!(state.is_enabled());
    }

    #[test]
    fn test_guard_keep() {
        let state = CancelState::new();
        state.disable_scoped().keep();
        assert!(!state.is_enabled());
        state.enable();
        assert!(state.is_enabled());
    }
}
