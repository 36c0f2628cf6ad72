//! Unix process signal plumbing

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use tracing::debug;
use vassal_core::{AlarmFallback, CoreError, CoreResult};

/// Process alarm used as the watchdog when no master is present
#[derive(Debug, Default, Clone, Copy)]
pub struct SysAlarm;

impl AlarmFallback for SysAlarm {
    fn schedule(&self, secs: u64) {
        let secs = secs.min(u32::MAX as u64) as u32;
        unsafe {
            libc::alarm(secs);
        }
    }
}

const HARAKIRI_NOTICE: &[u8] = b"*** HARAKIRI ON WORKER (alarm fired, no master) ***\n";

extern "C" fn harakiri_alarm(_sig: libc::c_int) {
    // Only async-signal-safe calls here
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            HARAKIRI_NOTICE.as_ptr() as *const libc::c_void,
            HARAKIRI_NOTICE.len(),
        );
        libc::_exit(1);
    }
}

/// Install the SIGALRM handler that ends a stuck worker
pub fn install_harakiri_handler() -> CoreResult<()> {
    let action = SigAction::new(
        SigHandler::Handler(harakiri_alarm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action) }.map_err(|e| CoreError::Os(e as i32))?;
    debug!("harakiri alarm handler installed");
    Ok(())
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGTERM and SIGINT to the shutdown flag
pub fn install_shutdown_handlers() -> CoreResult<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        unsafe { sigaction(sig, &action) }.map_err(|e| CoreError::Os(e as i32))?;
    }
    Ok(())
}

#[inline]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Send `sig` to `pid`
pub fn kill_pid(pid: i32, sig: Signal) -> CoreResult<()> {
    kill(Pid::from_raw(pid), sig).map_err(|e| CoreError::Os(e as i32))
}
