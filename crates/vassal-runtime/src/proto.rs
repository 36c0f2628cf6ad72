//! Default line protocol
//!
//! A request is a block of `KEY=value` lines terminated by an empty line;
//! anything after the blank line is body. Lines end in `\n` or `\r\n`.
//!
//! ```text
//! PATH_INFO=/hello
//! HTTP_USER_AGENT=curl
//!
//! <body>
//! ```
//!
//! Variables are recorded as ranges into the core buffer, so parsing never
//! allocates.

use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, warn};
use vassal_core::{
    last_errno, CoreBuffers, CoreError, CoreResult, HeaderVec, Protocol, ReceiveStatus, Request,
};

use crate::io::{close_fd, set_nonblocking, write_all};

pub struct LineProtocol {
    write_timeout: Duration,
}

impl LineProtocol {
    pub fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::defaults::SOCKET_TIMEOUT))
    }
}

/// Offset just past the blank line ending the header block
fn header_end(buf: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = buf[start..].iter().position(|b| *b == b'\n') {
        let nl = start + rel;
        let line = &buf[start..nl];
        if line.is_empty() || line == b"\r" {
            return Some(nl + 1);
        }
        start = nl + 1;
    }
    None
}

/// Record every `KEY=value` line of `buf[..end]`; false if the slots run out
fn parse_vars(buffers: &mut CoreBuffers, end: usize) -> bool {
    buffers.hvec.clear();
    let mut start = 0;
    while start < end {
        let nl = buffers.buffer[start..end]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(end, |rel| start + rel);
        let mut line_end = nl;
        if line_end > start && buffers.buffer[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        if line_end > start {
            let eq = buffers.buffer[start..line_end].iter().position(|b| *b == b'=');
            let (key, value) = match eq {
                Some(eq) => (
                    HeaderVec::new(start, eq),
                    HeaderVec::new(start + eq + 1, line_end - start - eq - 1),
                ),
                None => (HeaderVec::new(start, line_end - start), HeaderVec::new(line_end, 0)),
            };
            if !buffers.push_var(key, value) {
                return false;
            }
        }
        start = nl + 1;
    }
    true
}

impl Protocol for LineProtocol {
    fn accept(&self, _req: &mut Request, listen_fd: RawFd) -> CoreResult<RawFd> {
        let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            return Err(CoreError::Accept(last_errno()));
        }
        if let Err(e) = set_nonblocking(fd) {
            close_fd(fd);
            return Err(e);
        }
        Ok(fd)
    }

    fn receive_step(&self, req: &mut Request, buffers: &mut CoreBuffers) -> ReceiveStatus {
        let Some(fd) = req.fd else {
            return ReceiveStatus::Error;
        };
        let cap = buffers.buffer.len();
        if req.pktsize >= cap {
            warn!(fd, cap, "request header block exceeds the buffer");
            return ReceiveStatus::Error;
        }
        let free = &mut buffers.buffer[req.pktsize..];
        let n = unsafe { libc::read(fd, free.as_mut_ptr() as *mut libc::c_void, free.len()) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EAGAIN || errno == libc::EINTR {
                return ReceiveStatus::WouldBlock;
            }
            debug!(fd, errno, "read failed");
            return ReceiveStatus::Error;
        }
        if n == 0 {
            debug!(fd, "peer closed before the header block ended");
            return ReceiveStatus::Error;
        }
        req.pktsize += n as usize;

        match header_end(&buffers.buffer[..req.pktsize]) {
            Some(end) => {
                req.header_len = end;
                if !parse_vars(buffers, end) {
                    warn!(fd, "too many request variables");
                    return ReceiveStatus::Error;
                }
                ReceiveStatus::Complete
            }
            None if req.pktsize == cap => {
                warn!(fd, cap, "request header block exceeds the buffer");
                ReceiveStatus::Error
            }
            None => ReceiveStatus::WouldBlock,
        }
    }

    fn write(&self, req: &mut Request, data: &[u8]) -> CoreResult<usize> {
        match req.fd {
            Some(fd) if !req.fd_closed => write_all(fd, data, self.write_timeout),
            _ => Err(CoreError::PeerClosed),
        }
    }

    fn close(&self, req: &mut Request) {
        if req.fd_closed {
            return;
        }
        if let Some(fd) = req.fd {
            close_fd(fd);
        }
        req.fd_closed = true;
    }

    fn name(&self) -> &'static str {
        "line"
    }
}
