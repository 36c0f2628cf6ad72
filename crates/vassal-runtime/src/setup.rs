//! Request setup, receive and dispatch

use std::time::Duration;

use tracing::info;
use vassal_core::{
    CoreError, CoreResult, CoreSlot, EventQueue, ReceiveStatus, RequestContext,
};

use crate::async_engine::AsyncTable;
use crate::io::wait_readable;
use crate::worker::WorkerContext;

/// Bind `slot` for a new request and honour a pending suspend.
///
/// Only references into the core's preallocated buffers are recorded here;
/// nothing is allocated.
pub fn setup_request(ctx: &WorkerContext, slot: &mut CoreSlot, socket: Option<usize>) {
    let CoreSlot { buffers, request } = slot;
    request.app_id = None;
    request.sendfile_fd = None;
    request.bind(buffers);
    if socket.is_some() {
        request.socket = socket;
    }

    ctx.core_stats(request.async_id()).set_in_request(false);

    let stats = ctx.stats();
    if stats.is_suspended() {
        info!(worker = ctx.worker_id(), "*** worker {} suspended ***", ctx.worker_id());
        while stats.is_suspended() {
            pause(ctx.config().suspend_poll);
        }
        info!(worker = ctx.worker_id(), "*** worker {} resumed ***", ctx.worker_id());
    }
}

/// Sleep that a signal can cut short
fn pause(d: Duration) {
    let ms = d.as_millis().min(i32::MAX as u128) as i32;
    unsafe {
        libc::poll(std::ptr::null_mut(), 0, ms);
    }
}

fn enter_request(ctx: &WorkerContext, slot: &mut CoreSlot) {
    let req = &mut slot.request;
    ctx.core_stats(req.async_id()).set_in_request(true);
    let now = ctx.clock().now_micros();
    req.start_of_request = now;
    req.start_of_request_in_sec = now / 1_000_000;
}

fn enter_harakiri(ctx: &WorkerContext) -> CoreResult<()> {
    let secs = ctx.config().harakiri;
    if secs > 0 {
        ctx.harakiri().arm(secs)?;
    }
    Ok(())
}

/// Read the request header synchronously.
///
/// Edge-triggered sockets already captured the request during accept.
pub fn receive_request(ctx: &WorkerContext, slot: &mut CoreSlot) -> CoreResult<()> {
    enter_request(ctx, slot);

    let sock = ctx
        .socket_for(&slot.request)
        .ok_or(CoreError::Protocol("request has no socket"))?;

    if !sock.is_edge_triggered() {
        let timeout = Duration::from_secs(ctx.config().socket_timeout);
        let CoreSlot { buffers, request } = slot;
        loop {
            match sock.protocol().receive_step(request, buffers) {
                ReceiveStatus::Complete => break,
                ReceiveStatus::WouldBlock => {
                    let fd = request.fd.ok_or(CoreError::PeerClosed)?;
                    if !wait_readable(fd, timeout)? {
                        return Err(CoreError::Timeout);
                    }
                }
                ReceiveStatus::Error => return Err(CoreError::Protocol("receive failed")),
            }
        }
    }

    enter_harakiri(ctx)
}

/// Start an asynchronous receive: watch the connection and return at once.
///
/// The event loop resumes the slot through `table` when the descriptor
/// turns readable, or destroys it when the receive timeout expires.
pub fn receive_request_async(
    ctx: &WorkerContext,
    queue: &dyn EventQueue,
    table: &mut AsyncTable,
    slot: &mut CoreSlot,
) -> CoreResult<()> {
    enter_request(ctx, slot);

    let req = &slot.request;
    if !req.do_not_add_to_async_queue {
        let fd = req.fd.ok_or(CoreError::PeerClosed)?;
        queue.add_read(fd)?;
        let deadline = req.start_of_request_in_sec + ctx.config().socket_timeout;
        table.add_timeout(req.async_id(), deadline);
        table.bind_fd(fd, req.async_id());
    }

    enter_harakiri(ctx)
}

/// Hand the request to the application; returns its status
pub fn dispatch_request(ctx: &WorkerContext, slot: &mut CoreSlot) -> CoreResult<i32> {
    let proto = ctx
        .protocol_for(&slot.request)
        .ok_or(CoreError::Protocol("request has no socket"))?;
    let CoreSlot { buffers, request } = slot;
    let status = {
        let mut rc = RequestContext::new(request, buffers, proto.as_ref());
        ctx.app().handle(&mut rc)
    };
    request.app_status = status;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::test_support::{HarnessBuilder, MockProtocol, ScriptedQueue};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use vassal_core::{AsyncId, BufferBinding};

    fn slot() -> CoreSlot {
        CoreSlot::new(AsyncId::new(0), 2048, 8, 512)
    }

    #[test]
    fn test_setup_binds_buffers() {
        let h = HarnessBuilder::new(ServerConfig::new()).build();
        let mut slot = slot();
        slot.request.app_id = Some(3);
        h.ctx.core_stats(AsyncId::new(0)).set_in_request(true);

        setup_request(&h.ctx, &mut slot, Some(0));

        assert_eq!(
            slot.request.binding,
            Some(BufferBinding { buffer_len: 2048, hvec_slots: 8, post_buffering: 512 })
        );
        assert_eq!(slot.request.app_id, None);
        assert_eq!(slot.request.socket, Some(0));
        assert!(!h.ctx.core_stats(AsyncId::new(0)).is_in_request());
    }

    #[test]
    fn test_suspend_gate_waits_for_resume() {
        let h = HarnessBuilder::new(
            ServerConfig::new().suspend_poll(Duration::from_millis(5)),
        )
        .build();
        let ctx = Arc::new(h.ctx);
        ctx.stats().set_suspended(true);

        let resumer = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ctx.stats().set_suspended(false);
            })
        };
        let mut slot = slot();
        setup_request(&ctx, &mut slot, None);
        assert!(!ctx.stats().is_suspended());
        resumer.join().unwrap();
    }

    #[test]
    fn test_receive_waits_then_arms_harakiri() {
        let (conn, mut peer) = UnixStream::pair().unwrap();
        let proto = MockProtocol::scripted(&[ReceiveStatus::WouldBlock]);
        let h = HarnessBuilder::new(ServerConfig::new().harakiri(20))
            .listen_fd(conn.as_raw_fd())
            .protocol(proto)
            .now(700)
            .build();
        let mut slot = slot();
        slot.request.socket = Some(0);
        slot.request.fd = Some(conn.as_raw_fd());
        peer.write_all(b"!").unwrap();

        receive_request(&h.ctx, &mut slot).unwrap();

        assert!(h.ctx.core_stats(AsyncId::new(0)).is_in_request());
        assert_eq!(slot.request.start_of_request_in_sec, 700);
        assert_eq!(h.ctx.stats().harakiri.get(), 720);
        assert_eq!(slot.request.pktsize, 5);
    }

    #[test]
    fn test_receive_error_and_timeout() {
        let (conn, _peer) = UnixStream::pair().unwrap();
        let proto = MockProtocol::scripted(&[ReceiveStatus::Error]);
        let h = HarnessBuilder::new(ServerConfig::new().harakiri(20))
            .listen_fd(conn.as_raw_fd())
            .protocol(proto)
            .build();
        let mut slot = slot();
        slot.request.socket = Some(0);
        slot.request.fd = Some(conn.as_raw_fd());
        assert_eq!(
            receive_request(&h.ctx, &mut slot),
            Err(CoreError::Protocol("receive failed"))
        );
        assert!(!h.ctx.stats().harakiri.is_armed());

        let proto = MockProtocol::scripted(&[ReceiveStatus::WouldBlock]);
        let h = HarnessBuilder::new(ServerConfig::new().socket_timeout(0))
            .listen_fd(conn.as_raw_fd())
            .protocol(proto)
            .build();
        let mut slot = self::slot();
        slot.request.socket = Some(0);
        slot.request.fd = Some(conn.as_raw_fd());
        assert_eq!(receive_request(&h.ctx, &mut slot), Err(CoreError::Timeout));
    }

    #[test]
    fn test_edge_triggered_skips_receive() {
        let (conn, _peer) = UnixStream::pair().unwrap();
        let proto = MockProtocol::scripted(&[ReceiveStatus::Error]);
        let h = HarnessBuilder::new(ServerConfig::new())
            .listen_fd(conn.as_raw_fd())
            .edge_triggered()
            .protocol(proto)
            .build();
        let mut slot = slot();
        slot.request.socket = Some(0);
        receive_request(&h.ctx, &mut slot).unwrap();
        assert_eq!(h.proto.script.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_async_receive_registers_and_returns() {
        let (conn, _peer) = UnixStream::pair().unwrap();
        let h = HarnessBuilder::new(ServerConfig::new().async_cores(4).socket_timeout(4))
            .listen_fd(conn.as_raw_fd())
            .now(50)
            .build();
        let queue = ScriptedQueue::default();
        let mut table = AsyncTable::new(4);
        let mut slot = CoreSlot::new(AsyncId::new(2), 1024, 8, 0);
        slot.request.socket = Some(0);
        slot.request.fd = Some(77);

        receive_request_async(&h.ctx, &queue, &mut table, &mut slot).unwrap();

        assert_eq!(*queue.added.lock().unwrap(), vec![77]);
        assert_eq!(table.lookup(77), Some(AsyncId::new(2)));
        assert!(table.expired(54).is_empty());
        assert_eq!(table.expired(55), vec![AsyncId::new(2)]);
        assert_eq!(h.proto.script.lock().unwrap().len(), 0);
        assert_eq!(h.app.handled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_records_status() {
        let (conn, _peer) = UnixStream::pair().unwrap();
        let h = HarnessBuilder::new(ServerConfig::new())
            .listen_fd(conn.as_raw_fd())
            .build();
        let mut slot = slot();
        assert!(dispatch_request(&h.ctx, &mut slot).is_err());

        slot.request.socket = Some(0);
        slot.buffers.buffer[..2].copy_from_slice(b"ok");
        slot.request.pktsize = 2;
        assert_eq!(dispatch_request(&h.ctx, &mut slot), Ok(0));
        assert_eq!(slot.request.app_status, 0);
        assert_eq!(h.proto.written(), b"HTTP/1.1 200 OK\r\n\r\nok".to_vec());
    }
}
