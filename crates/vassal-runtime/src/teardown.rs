//! Request teardown
//!
//! [`close_request`] runs every step, in order, for every request that got
//! as far as dispatch. A failing step is logged and the remaining steps
//! still run. [`destroy_request`] is the short path for requests that never
//! reached dispatch.

use std::sync::atomic::Ordering;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};
use vassal_core::{CancelState, CoreSlot, RequestContext, UploadState};

use crate::memusage::{self, MemoryUsage};
use crate::worker::{RetireReason, WorkerContext};

/// What the core should do after a request was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Continue,
    Retire(RetireReason),
}

/// Finalize, account and recycle the request held by `slot`
pub fn close_request(
    ctx: &WorkerContext,
    slot: &mut CoreSlot,
    cancel: Option<&CancelState>,
) -> TeardownOutcome {
    let worker = ctx.worker_id();
    let id = slot.id();
    let proto = ctx.protocol_for(&slot.request).cloned();
    let CoreSlot { buffers, request: req } = slot;

    // Final transformations
    if !req.transformations.is_empty() {
        let mut transforms = std::mem::take(&mut req.transformations);
        let mut body = Some(std::mem::take(&mut req.transform_buf));
        for t in transforms.iter_mut() {
            let Some(input) = body.take() else { break };
            match t.finalize(input) {
                Ok(out) => body = Some(out),
                Err(e) => warn!(worker, core = %id, error = %e, "transformation failed"),
            }
        }
        if let (Some(out), Some(p)) = (body.filter(|b| !b.is_empty()), proto.as_ref()) {
            let mut rc = RequestContext::new(req, buffers, p.as_ref());
            if let Err(e) = rc.write(&out) {
                debug!(worker, core = %id, error = %e, "unable to write transformed body");
            }
        }
    }

    // Default headers when the application started a response but wrote nothing
    if req.headers.is_some() && !req.headers_sent && req.headers_size == 0 && req.response_size == 0 {
        if let Some(p) = proto.as_ref() {
            let mut rc = RequestContext::new(req, buffers, p.as_ref());
            if let Err(e) = rc.flush_headers() {
                debug!(worker, core = %id, error = %e, "unable to write default headers");
            }
        }
    }
    req.headers = None;

    // Timing
    let end = ctx.clock().now_micros();
    req.end_of_request = end;
    let stats = ctx.stats();
    stats.record_response_time(req.duration_us());

    // Memory sampling
    let mut usage = MemoryUsage::default();
    if ctx.config().samples_memory() {
        match memusage::sample() {
            Ok(u) => {
                stats.set_memory(u.rss, u.vsz);
                usage = u;
            }
            Err(e) => warn!(worker, error = %e, "unable to sample memory usage"),
        }
    }

    // Counters
    if !req.do_not_account {
        ctx.table().global().requests.fetch_add(1, Ordering::Relaxed);
        stats.count_request();
        ctx.core_stats(id).count_request(req.write_errors);
    }

    if let Some(p) = proto.as_ref() {
        let mut rc = RequestContext::new(req, buffers, p.as_ref());
        ctx.app().after_accounting(&mut rc);
    }

    if !req.fd_closed {
        match proto.as_ref() {
            Some(p) => p.close(req),
            None => warn!(worker, core = %id, "no protocol to close the connection"),
        }
    }

    req.upload = UploadState::default();
    req.proto_parser_buf = None;

    if let Some(p) = proto.as_ref() {
        let mut rc = RequestContext::new(req, buffers, p.as_ref());
        ctx.app().after_request(&mut rc);
    }

    if let Some(c) = cancel {
        c.enable();
    }

    // Leave harakiri mode
    if let Err(e) = ctx.harakiri().disarm() {
        warn!(worker, error = %e, "unable to clear harakiri");
    }
    if let Err(e) = ctx.user_harakiri().disarm() {
        warn!(worker, error = %e, "unable to clear user harakiri");
    }

    if !req.do_not_account {
        stats.add_tx(req.response_size + req.headers_size);
    }

    if ctx.config().reaper {
        reap_children();
    }

    req.logvars.clear();
    req.additional_headers.clear();
    req.remove_headers.clear();
    req.websocket_buf = None;

    req.reset();
    buffers.hvec.clear();
    ctx.core_stats(id).set_in_request(false);

    let outcome = match retire_reason(ctx, end, usage) {
        Some(reason) => {
            ctx.retire(reason);
            TeardownOutcome::Retire(reason)
        }
        None => TeardownOutcome::Continue,
    };

    if let Some(sup) = ctx.supervisor() {
        sup.announce_loyalty();
    }

    outcome
}

/// Self-retirement thresholds, each gated by the minimum worker lifetime
fn retire_reason(ctx: &WorkerContext, end_us: u64, usage: MemoryUsage) -> Option<RetireReason> {
    let config = ctx.config();
    let stats = ctx.stats();
    let lived = end_us.saturating_sub(stats.last_spawn.load(Ordering::Acquire) * 1_000_000);
    let grace_over = lived >= config.min_worker_lifetime * 1_000_000;

    if config.max_requests > 0
        && stats.delta_requests.load(Ordering::Acquire) >= config.max_requests
        && grace_over
    {
        return Some(RetireReason::MaxRequests);
    }
    if config.reload_on_as > 0 && usage.vsz >= config.reload_on_as && grace_over {
        return Some(RetireReason::AddressSpace);
    }
    if config.reload_on_rss > 0 && usage.rss >= config.reload_on_rss && grace_over {
        return Some(RetireReason::ResidentSet);
    }
    None
}

/// Reap every exited child without blocking
fn reap_children() {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => debug!(?status, "reaped child"),
        }
    }
}

/// Abort a request that never reached dispatch.
///
/// The core leaves request mode exactly as in [`close_request`]: watchdogs
/// disarmed, `in_request` cleared, parsed variables dropped.
pub fn destroy_request(ctx: &WorkerContext, slot: &mut CoreSlot, cancel: Option<&CancelState>) {
    let worker = ctx.worker_id();
    let id = slot.id();
    let req = &mut slot.request;
    if let Some(p) = ctx.protocol_for(req) {
        p.close(req);
    }
    if let Some(c) = cancel {
        c.enable();
    }
    if let Err(e) = ctx.harakiri().disarm() {
        warn!(worker, error = %e, "unable to clear harakiri");
    }
    if let Err(e) = ctx.user_harakiri().disarm() {
        warn!(worker, error = %e, "unable to clear user harakiri");
    }
    slot.buffers.hvec.clear();
    req.reset();
    ctx.core_stats(id).set_in_request(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::test_support::{Harness, HarnessBuilder, MockProtocol};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use vassal_core::constants::LOYALTY_BYTE;
    use vassal_core::{AsyncId, Clock, CoreResult, LogVar, Transformation};

    struct Shout;

    impl Transformation for Shout {
        fn finalize(&mut self, input: Vec<u8>) -> CoreResult<Vec<u8>> {
            let mut out = input.to_ascii_uppercase();
            out.push(b'!');
            Ok(out)
        }
    }

    fn harness(config: ServerConfig, proto: MockProtocol, fd: i32) -> Harness {
        HarnessBuilder::new(config)
            .listen_fd(fd)
            .protocol(proto)
            .supervised(0)
            .build()
    }

    fn in_flight(h: &Harness, id: u32) -> CoreSlot {
        let mut slot = CoreSlot::new(AsyncId::new(id), 1024, 8, 0);
        crate::setup::setup_request(&h.ctx, &mut slot, Some(0));
        slot.request.start_of_request = h.clock.now_micros();
        h.ctx.core_stats(slot.id()).set_in_request(true);
        slot
    }

    #[test]
    fn test_slot_reuse_invariant() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new().threads(2), MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 1);

        for n in 1..=5u64 {
            slot.request.headers = Some(b"HTTP/1.1 200 OK\r\n".to_vec());
            slot.request.additional_headers.push("X-N: 1".into());
            slot.request.logvars.push(LogVar { key: "k".into(), value: "v".into() });
            slot.request.websocket_buf = Some(vec![0; 8]);
            slot.request.upload.read_buf = Some(vec![0; 8]);
            slot.request.response_size = 10;

            let outcome = close_request(&h.ctx, &mut slot, None);

            assert_eq!(outcome, TeardownOutcome::Continue);
            assert!(slot.request.is_pristine());
            assert_eq!(slot.request.async_id(), AsyncId::new(1));
            assert_eq!(h.ctx.stats().requests.load(Ordering::Relaxed), n);
            assert_eq!(h.ctx.table().global().requests.load(Ordering::Relaxed), n);
            assert!(!h.ctx.core_stats(AsyncId::new(1)).is_in_request());
            crate::setup::setup_request(&h.ctx, &mut slot, Some(0));
        }
        assert_eq!(h.ctx.stats().tx.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_transformations_applied_before_close() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new(), MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 0);
        slot.request.transformations.push(Box::new(Shout));
        slot.request.transform_buf.extend_from_slice(b"quiet");

        close_request(&h.ctx, &mut slot, None);

        assert_eq!(h.proto.written(), b"QUIET!".to_vec());
        assert_eq!(h.proto.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.ctx.stats().tx.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_default_headers_only_when_nothing_sent() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new(), MockProtocol::default(), a.as_raw_fd());

        let mut slot = in_flight(&h, 0);
        slot.request.headers = Some(b"HTTP/1.1 204 No Content\r\n".to_vec());
        close_request(&h.ctx, &mut slot, None);
        assert_eq!(h.proto.written(), b"HTTP/1.1 204 No Content\r\n\r\n".to_vec());

        let mut slot = in_flight(&h, 0);
        slot.request.headers = Some(b"HTTP/1.1 200 OK\r\n".to_vec());
        slot.request.response_size = 3;
        close_request(&h.ctx, &mut slot, None);
        assert_eq!(h.proto.written().len(), 27);
    }

    #[test]
    fn test_accounting_opt_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new(), MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 0);
        slot.request.do_not_account = true;
        slot.request.response_size = 100;
        slot.request.write_errors = 2;

        close_request(&h.ctx, &mut slot, None);

        assert_eq!(h.ctx.stats().requests.load(Ordering::Relaxed), 0);
        assert_eq!(h.ctx.stats().tx.load(Ordering::Relaxed), 0);
        assert_eq!(h.ctx.core_stats(AsyncId::new(0)).write_errors.load(Ordering::Relaxed), 0);
        // Hooks still run
        assert_eq!(h.app.after_accounting.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_errors_and_timing() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new(), MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 0);
        slot.request.write_errors = 3;
        h.clock.advance_micros(100);
        close_request(&h.ctx, &mut slot, None);

        let mut slot = in_flight(&h, 0);
        h.clock.advance_micros(300);
        close_request(&h.ctx, &mut slot, None);

        let stats = h.ctx.stats();
        assert_eq!(stats.avg_response_time.load(Ordering::Relaxed), 175);
        assert_eq!(stats.running_time.load(Ordering::Relaxed), 400);
        assert_eq!(h.ctx.core_stats(AsyncId::new(0)).write_errors.load(Ordering::Relaxed), 3);
        assert_eq!(h.ctx.core_stats(AsyncId::new(0)).requests.load(Ordering::Relaxed), 2);
        assert_eq!(h.app.after_request.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_harakiri_cleared_and_cancel_enabled() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new().threads(2), MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 0);
        h.ctx.harakiri().arm(30).unwrap();
        h.ctx.user_harakiri().arm(60).unwrap();
        let cancel = CancelState::new();
        cancel.disable();

        close_request(&h.ctx, &mut slot, Some(&cancel));

        assert!(!h.ctx.stats().harakiri.is_armed());
        assert!(!h.ctx.stats().user_harakiri.is_armed());
        assert!(cancel.is_enabled());
    }

    #[test]
    fn test_loyalty_exactly_once() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new(), MockProtocol::default(), a.as_raw_fd());
        for _ in 0..4 {
            let mut slot = in_flight(&h, 0);
            close_request(&h.ctx, &mut slot, None);
        }
        assert_eq!(*h.link.as_ref().unwrap().lock().unwrap(), vec![LOYALTY_BYTE]);
    }

    #[test]
    fn test_max_requests_gated_by_lifetime() {
        let (a, _b) = UnixStream::pair().unwrap();
        let config = ServerConfig::new().max_requests(2).min_worker_lifetime(60);
        let h = harness(config, MockProtocol::default(), a.as_raw_fd());
        h.ctx.stats().last_spawn.store(990, Ordering::Relaxed);

        let mut slot = in_flight(&h, 0);
        assert_eq!(close_request(&h.ctx, &mut slot, None), TeardownOutcome::Continue);
        let mut slot = in_flight(&h, 0);
        // Threshold met, but the worker is only 10 seconds old
        assert_eq!(close_request(&h.ctx, &mut slot, None), TeardownOutcome::Continue);
        assert!(!h.ctx.is_retiring());

        h.clock.set_secs(1_050);
        let mut slot = in_flight(&h, 0);
        assert_eq!(
            close_request(&h.ctx, &mut slot, None),
            TeardownOutcome::Retire(RetireReason::MaxRequests)
        );
        assert!(h.ctx.is_retiring());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_threshold_retires() {
        let (a, _b) = UnixStream::pair().unwrap();
        let config = ServerConfig::new().reload_on_rss(1).min_worker_lifetime(0);
        let h = harness(config, MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 0);
        assert_eq!(
            close_request(&h.ctx, &mut slot, None),
            TeardownOutcome::Retire(RetireReason::ResidentSet)
        );
        assert!(h.ctx.stats().rss_size.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_destroy_request_is_abbreviated() {
        let (a, _b) = UnixStream::pair().unwrap();
        let h = harness(ServerConfig::new().threads(2), MockProtocol::default(), a.as_raw_fd());
        let mut slot = in_flight(&h, 0);
        let cancel = CancelState::new();
        cancel.disable();
        h.ctx.harakiri().arm(30).unwrap();
        h.ctx.user_harakiri().arm(60).unwrap();
        slot.buffers.hvec.push(vassal_core::HeaderVec::new(0, 3));

        destroy_request(&h.ctx, &mut slot, Some(&cancel));

        assert!(slot.request.is_pristine());
        assert!(cancel.is_enabled());
        assert!(!h.ctx.stats().harakiri.is_armed());
        assert!(!h.ctx.stats().user_harakiri.is_armed());
        assert!(!h.ctx.core_stats(AsyncId::new(0)).is_in_request());
        assert!(slot.buffers.hvec.is_empty());
        assert_eq!(h.proto.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.ctx.stats().requests.load(Ordering::Relaxed), 0);
        assert_eq!(h.app.after_request.load(Ordering::SeqCst), 0);
        assert!(h.link.as_ref().unwrap().lock().unwrap().is_empty());
    }
}
