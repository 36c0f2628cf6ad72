//! Accept loop
//!
//! One call resolves at most one ready connection for one core:
//!
//! ```text
//!   lock thunder ──> wait(queue, timeout) ──> timeout? heartbeat, no request
//!                                         ──> signal fd? deliver, no request
//!                                         ──> socket fd / retry / thread fd?
//!                                               protocol accept, unlock
//! ```
//!
//! The thunder lock is held from entering the wait until the protocol has
//! claimed the ready descriptor, so one readiness event wakes one waiter.
//! In multi-threaded workers cancellation is disabled from readiness until
//! teardown re-enables it.

use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, warn};
use vassal_core::{CancelState, CoreError, CoreResult, CoreSlot, EventQueue, ThunderGuard};

use crate::io::{set_cloexec, set_tcp_nodelay};
use crate::worker::WorkerContext;

/// Wait for and accept one connection into `slot`.
///
/// Returns `Err(CoreError::NoRequest)` when the wait ended without a
/// connection (timeout, signal delivery, foreign descriptor).
pub fn accept_request(
    ctx: &WorkerContext,
    queue: &dyn EventQueue,
    slot: &mut CoreSlot,
    cancel: Option<&CancelState>,
) -> CoreResult<()> {
    let id = slot.id();
    let thunder = ThunderGuard::acquire(ctx.thunder());

    let mut timeout = ctx.supervisor().and_then(|s| s.heartbeat_interval());
    if ctx.sockets().iter().any(|s| s.needs_retry(id)) {
        timeout = Some(Duration::ZERO);
    }

    let ready = queue.wait(timeout)?;

    if timeout.is_some_and(|t| !t.is_zero()) {
        if let Some(sup) = ctx.supervisor() {
            sup.heartbeat(ctx.clock().now_secs());
        }
        if ready.is_none() {
            return Err(CoreError::NoRequest);
        }
    }

    let cancel_guard = cancel
        .filter(|_| ctx.config().threads > 1)
        .map(CancelState::disable_scoped);

    if let Some(fd) = ready.filter(|fd| ctx.signals().owns(*fd)) {
        drop(thunder);
        if let Err(e) = ctx.signals().receive(fd, ctx.worker_id()) {
            warn!(worker = ctx.worker_id(), fd, error = %e, "signal receive failed");
        }
        return Err(CoreError::NoRequest);
    }

    for (index, sock) in ctx.sockets().iter().enumerate() {
        if !sock.matches(ready, id) {
            continue;
        }
        let req = &mut slot.request;
        req.socket = Some(index);
        let accepted = sock.protocol().accept(req, ready.unwrap_or(sock.fd()));
        drop(thunder);

        let fd = accepted?;
        req.fd = Some(fd);
        sock.set_retry(id, req.retry_requested);
        if !sock.is_edge_triggered() {
            post_accept(ctx, fd, false);
        }
        if let Some(guard) = cancel_guard {
            guard.keep();
        }
        debug!(worker = ctx.worker_id(), core = %id, fd, socket = sock.name(), "accepted");
        return Ok(());
    }

    Err(CoreError::NoRequest)
}

/// Accept on a descriptor already known to be ready, without waiting
pub fn simple_accept(
    ctx: &WorkerContext,
    slot: &mut CoreSlot,
    socket: usize,
    fd: RawFd,
) -> CoreResult<()> {
    let sock = ctx
        .sockets()
        .get(socket)
        .ok_or(CoreError::Protocol("unknown listening socket"))?;
    let req = &mut slot.request;
    req.socket = Some(socket);
    let conn = sock.protocol().accept(req, fd)?;
    req.fd = Some(conn);
    post_accept(ctx, conn, sock.is_edge_triggered());
    Ok(())
}

/// Per-connection descriptor options; failures are only logged
fn post_accept(ctx: &WorkerContext, fd: RawFd, edge_triggered: bool) {
    let config = ctx.config();
    if !edge_triggered && config.close_on_exec {
        if let Err(e) = set_cloexec(fd) {
            warn!(fd, error = %e, "unable to set close-on-exec");
        }
    }
    if config.tcp_nodelay {
        if let Err(e) = set_tcp_nodelay(fd) {
            warn!(fd, error = %e, "unable to set TCP_NODELAY");
        }
    }
}
