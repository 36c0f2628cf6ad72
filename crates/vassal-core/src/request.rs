//! Request slots
//!
//! A [`Request`] is the per-core record describing the in-flight request.
//! Slots are reused for the life of the worker: teardown resets every field
//! to its zero value except the owning core's [`AsyncId`].
//!
//! Large buffers are not owned by the request. They belong to the core
//! ([`CoreBuffers`]) and are allocated once at startup; setup only records
//! the binding, and protocols fill them in place.

use std::fmt;
use std::fs::File;
use std::io::Write as _;
use std::os::fd::RawFd;

use crate::error::CoreResult;
use crate::id::AsyncId;
use crate::traits::{Protocol, Transformation};

/// One parsed header item: a byte range inside the core buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderVec {
    pub offset: usize,
    pub len: usize,
}

impl HeaderVec {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    #[inline]
    pub fn slice<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        let end = (self.offset + self.len).min(buf.len());
        &buf[self.offset.min(end)..end]
    }
}

/// Preallocated per-core storage
pub struct CoreBuffers {
    /// Raw request header buffer
    pub buffer: Box<[u8]>,
    /// Parsed key/value ranges, stored as consecutive pairs
    pub hvec: Vec<HeaderVec>,
    /// Request body staging area when post buffering is configured
    pub post_buf: Option<Box<[u8]>>,
}

impl CoreBuffers {
    pub fn new(buffer_size: usize, hvec_slots: usize, post_buffering: usize) -> Self {
        Self {
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            hvec: Vec::with_capacity(hvec_slots * 2),
            post_buf: if post_buffering > 0 {
                Some(vec![0u8; post_buffering].into_boxed_slice())
            } else {
                None
            },
        }
    }

    /// Record one key/value pair; false once the preallocated slots are used up
    pub fn push_var(&mut self, key: HeaderVec, value: HeaderVec) -> bool {
        if self.hvec.len() + 2 > self.hvec.capacity() {
            return false;
        }
        self.hvec.push(key);
        self.hvec.push(value);
        true
    }

    /// Look a variable up by exact name; the most recent definition wins
    pub fn var(&self, key: &[u8]) -> Option<&[u8]> {
        self.hvec
            .chunks_exact(2)
            .rev()
            .find(|pair| pair[0].slice(&self.buffer) == key)
            .map(|pair| pair[1].slice(&self.buffer))
    }

    pub fn var_count(&self) -> usize {
        self.hvec.len() / 2
    }
}

/// Map an HTTP-style header name to the variable name protocols store it
/// under: `User-Agent` becomes `HTTP_USER_AGENT`, while `Content-Length`
/// and `Content-Type` lose the prefix.
pub fn cgi_var_name(header: &str) -> String {
    let upper: String = header
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    if upper == "CONTENT_LENGTH" || upper == "CONTENT_TYPE" {
        upper
    } else {
        format!("HTTP_{upper}")
    }
}

/// Sizes recorded when a request is bound to its core's buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer_len: usize,
    pub hvec_slots: usize,
    pub post_buffering: usize,
}

/// Key/value pair attached to the request log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogVar {
    pub key: String,
    pub value: String,
}

/// Per-request upload state
#[derive(Debug, Default)]
pub struct UploadState {
    pub file: Option<File>,
    pub read_buf: Option<Vec<u8>>,
    pub readline_buf: Option<Vec<u8>>,
}

impl UploadState {
    fn is_empty(&self) -> bool {
        self.file.is_none() && self.read_buf.is_none() && self.readline_buf.is_none()
    }
}

/// The in-flight request record of one core
pub struct Request {
    async_id: AsyncId,

    /// Accepted connection
    pub fd: Option<RawFd>,
    /// Index of the listening socket the connection came from
    pub socket: Option<usize>,
    pub fd_closed: bool,
    pub sendfile_fd: Option<RawFd>,
    pub app_id: Option<usize>,
    pub binding: Option<BufferBinding>,

    /// Microseconds since the epoch
    pub start_of_request: u64,
    pub start_of_request_in_sec: u64,
    pub end_of_request: u64,

    /// Bytes buffered so far
    pub pktsize: usize,
    /// Offset where the header block ends inside the buffer
    pub header_len: usize,

    pub status: u16,
    pub app_status: i32,
    pub response_size: u64,
    pub headers_size: u64,
    pub headers_sent: bool,
    pub write_errors: u64,

    pub do_not_account: bool,
    pub do_not_add_to_async_queue: bool,
    pub retry_requested: bool,

    /// Response header block under construction
    pub headers: Option<Vec<u8>>,
    pub additional_headers: Vec<String>,
    pub remove_headers: Vec<String>,
    pub logvars: Vec<LogVar>,
    pub transformations: Vec<Box<dyn Transformation>>,
    /// Body held back for the final transformations
    pub transform_buf: Vec<u8>,
    pub upload: UploadState,
    pub proto_parser_buf: Option<Vec<u8>>,
    pub websocket_buf: Option<Vec<u8>>,
}

impl Request {
    pub fn new(async_id: AsyncId) -> Self {
        Self {
            async_id,
            fd: None,
            socket: None,
            fd_closed: false,
            sendfile_fd: None,
            app_id: None,
            binding: None,
            start_of_request: 0,
            start_of_request_in_sec: 0,
            end_of_request: 0,
            pktsize: 0,
            header_len: 0,
            status: 0,
            app_status: 0,
            response_size: 0,
            headers_size: 0,
            headers_sent: false,
            write_errors: 0,
            do_not_account: false,
            do_not_add_to_async_queue: false,
            retry_requested: false,
            headers: None,
            additional_headers: Vec::new(),
            remove_headers: Vec::new(),
            logvars: Vec::new(),
            transformations: Vec::new(),
            transform_buf: Vec::new(),
            upload: UploadState::default(),
            proto_parser_buf: None,
            websocket_buf: None,
        }
    }

    #[inline]
    pub fn async_id(&self) -> AsyncId {
        self.async_id
    }

    /// Zero every field except the async id
    pub fn reset(&mut self) {
        *self = Request::new(self.async_id);
    }

    /// Record the binding to the owning core's buffers
    pub fn bind(&mut self, buffers: &CoreBuffers) {
        self.binding = Some(BufferBinding {
            buffer_len: buffers.buffer.len(),
            hvec_slots: buffers.hvec.capacity() / 2,
            post_buffering: buffers.post_buf.as_ref().map_or(0, |b| b.len()),
        });
    }

    /// Request time in microseconds, saturating at zero on clock skew
    #[inline]
    pub fn duration_us(&self) -> u64 {
        self.end_of_request.saturating_sub(self.start_of_request)
    }

    /// True when every field holds its zero value
    pub fn is_pristine(&self) -> bool {
        self.fd.is_none()
            && self.socket.is_none()
            && !self.fd_closed
            && self.sendfile_fd.is_none()
            && self.app_id.is_none()
            && self.binding.is_none()
            && self.start_of_request == 0
            && self.start_of_request_in_sec == 0
            && self.end_of_request == 0
            && self.pktsize == 0
            && self.header_len == 0
            && self.status == 0
            && self.app_status == 0
            && self.response_size == 0
            && self.headers_size == 0
            && !self.headers_sent
            && self.write_errors == 0
            && !self.do_not_account
            && !self.do_not_add_to_async_queue
            && !self.retry_requested
            && self.headers.is_none()
            && self.additional_headers.is_empty()
            && self.remove_headers.is_empty()
            && self.logvars.is_empty()
            && self.transformations.is_empty()
            && self.transform_buf.is_empty()
            && self.upload.is_empty()
            && self.proto_parser_buf.is_none()
            && self.websocket_buf.is_none()
    }

    /// Render the pending response header block: the status line and
    /// headers, plus additional headers not named in the remove list,
    /// terminated by a blank line.
    pub fn render_headers(&self) -> Option<Vec<u8>> {
        let base = self.headers.as_ref()?;
        let mut out = Vec::with_capacity(base.len() + 64);
        for line in base.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if !self.is_removed(line) {
                out.extend_from_slice(line);
                out.extend_from_slice(b"\r\n");
            }
        }
        for header in &self.additional_headers {
            if !self.is_removed(header.as_bytes()) {
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        Some(out)
    }

    fn is_removed(&self, line: &[u8]) -> bool {
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return false;
        };
        let name = trim_ascii(&line[..colon]);
        self.remove_headers
            .iter()
            .any(|r| r.as_bytes().eq_ignore_ascii_case(name))
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("async_id", &self.async_id)
            .field("fd", &self.fd)
            .field("socket", &self.socket)
            .field("pktsize", &self.pktsize)
            .field("status", &self.status)
            .field("response_size", &self.response_size)
            .field("headers_size", &self.headers_size)
            .field("transformations", &self.transformations.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatch context
// ============================================================================

/// What an application sees while handling a request
pub struct RequestContext<'a> {
    pub request: &'a mut Request,
    pub buffers: &'a mut CoreBuffers,
    protocol: &'a dyn Protocol,
}

impl<'a> RequestContext<'a> {
    pub fn new(
        request: &'a mut Request,
        buffers: &'a mut CoreBuffers,
        protocol: &'a dyn Protocol,
    ) -> Self {
        Self {
            request,
            buffers,
            protocol,
        }
    }

    /// Body bytes that arrived together with the header block
    pub fn payload(&self) -> &[u8] {
        let end = self.request.pktsize.min(self.buffers.buffer.len());
        let start = self.request.header_len.min(end);
        &self.buffers.buffer[start..end]
    }

    /// Request variable by its stored name
    pub fn var(&self, key: &str) -> Option<&[u8]> {
        self.buffers.var(key.as_bytes())
    }

    /// Request header by its HTTP name
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.buffers.var(cgi_var_name(name).as_bytes())
    }

    /// Start the response header block
    pub fn start_response(&mut self, status: u16, reason: &str) {
        let mut head = Vec::with_capacity(64);
        // Writing into a Vec cannot fail
        let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");
        self.request.status = status;
        self.request.headers = Some(head);
    }

    pub fn add_header(&mut self, line: impl Into<String>) {
        self.request.additional_headers.push(line.into());
    }

    pub fn remove_header(&mut self, name: impl Into<String>) {
        self.request.remove_headers.push(name.into());
    }

    pub fn log_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.request.logvars.push(LogVar {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn add_transformation(&mut self, t: Box<dyn Transformation>) {
        self.request.transformations.push(t);
    }

    /// Write body bytes.
    ///
    /// With transformations installed the body is buffered until teardown;
    /// otherwise pending headers are flushed first.
    pub fn write(&mut self, data: &[u8]) -> CoreResult<usize> {
        if !self.request.transformations.is_empty() {
            self.request.transform_buf.extend_from_slice(data);
            return Ok(data.len());
        }
        self.flush_headers()?;
        self.write_raw(data)
    }

    /// Send the pending header block once
    pub fn flush_headers(&mut self) -> CoreResult<()> {
        if self.request.headers_sent {
            return Ok(());
        }
        let Some(block) = self.request.render_headers() else {
            return Ok(());
        };
        match self.protocol.write(self.request, &block) {
            Ok(n) => {
                self.request.headers_sent = true;
                self.request.headers_size += n as u64;
                Ok(())
            }
            Err(e) => {
                self.request.write_errors += 1;
                Err(e)
            }
        }
    }

    /// Write straight to the connection, bypassing transformations
    pub fn write_raw(&mut self, data: &[u8]) -> CoreResult<usize> {
        match self.protocol.write(self.request, data) {
            Ok(n) => {
                self.request.response_size += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.request.write_errors += 1;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::traits::ReceiveStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SinkProtocol {
        out: Mutex<Vec<u8>>,
        fail: bool,
    }

    impl Protocol for SinkProtocol {
        fn accept(&self, _req: &mut Request, _fd: RawFd) -> CoreResult<RawFd> {
            Ok(3)
        }
        fn receive_step(&self, _req: &mut Request, _b: &mut CoreBuffers) -> ReceiveStatus {
            ReceiveStatus::Complete
        }
        fn write(&self, _req: &mut Request, data: &[u8]) -> CoreResult<usize> {
            if self.fail {
                return Err(CoreError::Os(32));
            }
            self.out.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn close(&self, req: &mut Request) {
            req.fd_closed = true;
        }
    }

    struct Upper;

    impl Transformation for Upper {
        fn finalize(&mut self, input: Vec<u8>) -> CoreResult<Vec<u8>> {
            Ok(input.to_ascii_uppercase())
        }
    }

    #[test]
    fn test_reset_keeps_async_id() {
        let buffers = CoreBuffers::new(128, 4, 0);
        let mut req = Request::new(AsyncId::new(5));
        req.fd = Some(9);
        req.bind(&buffers);
        req.response_size = 10;
        req.logvars.push(LogVar { key: "a".into(), value: "b".into() });
        req.transformations.push(Box::new(Upper));
        req.websocket_buf = Some(vec![1, 2, 3]);
        assert!(!req.is_pristine());

        req.reset();
        assert!(req.is_pristine());
        assert_eq!(req.async_id(), AsyncId::new(5));
    }

    #[test]
    fn test_bind_records_core_buffers() {
        let buffers = CoreBuffers::new(256, 8, 1024);
        let mut req = Request::new(AsyncId::new(0));
        req.bind(&buffers);
        assert_eq!(
            req.binding,
            Some(BufferBinding { buffer_len: 256, hvec_slots: 8, post_buffering: 1024 })
        );
    }

    #[test]
    fn test_var_lookup_latest_wins() {
        let mut buffers = CoreBuffers::new(64, 2, 0);
        buffers.buffer[..15].copy_from_slice(b"KEYoneKEYtwoXYZ");
        assert!(buffers.push_var(HeaderVec::new(0, 3), HeaderVec::new(3, 3)));
        assert!(buffers.push_var(HeaderVec::new(6, 3), HeaderVec::new(9, 3)));
        assert!(!buffers.push_var(HeaderVec::new(12, 3), HeaderVec::new(0, 1)));
        assert_eq!(buffers.var(b"KEY"), Some(&b"two"[..]));
        assert_eq!(buffers.var(b"NOPE"), None);
        assert_eq!(buffers.var_count(), 2);
    }

    #[test]
    fn test_cgi_var_name() {
        assert_eq!(cgi_var_name("User-Agent"), "HTTP_USER_AGENT");
        assert_eq!(cgi_var_name("content-length"), "CONTENT_LENGTH");
        assert_eq!(cgi_var_name("Content-Type"), "CONTENT_TYPE");
    }

    #[test]
    fn test_write_flushes_headers_once() {
        let proto = SinkProtocol::default();
        let mut buffers = CoreBuffers::new(64, 2, 0);
        let mut req = Request::new(AsyncId::new(0));
        {
            let mut ctx = RequestContext::new(&mut req, &mut buffers, &proto);
            ctx.start_response(200, "OK");
            ctx.add_header("X-One: 1");
            ctx.add_header("X-Two: 2");
            ctx.remove_header("x-two");
            ctx.write(b"hi").unwrap();
            ctx.write(b"!").unwrap();
        }
        let out = proto.out.lock().unwrap().clone();
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nX-One: 1\r\n\r\nhi!".to_vec());
        assert!(req.headers_sent);
        assert_eq!(req.headers_size, 29);
        assert_eq!(req.response_size, 3);
    }

    #[test]
    fn test_transformations_buffer_body() {
        let proto = SinkProtocol::default();
        let mut buffers = CoreBuffers::new(64, 2, 0);
        let mut req = Request::new(AsyncId::new(0));
        let mut ctx = RequestContext::new(&mut req, &mut buffers, &proto);
        ctx.add_transformation(Box::new(Upper));
        assert_eq!(ctx.write(b"abc").unwrap(), 3);
        assert_eq!(ctx.request.transform_buf, b"abc".to_vec());
        assert_eq!(ctx.request.response_size, 0);
        assert!(proto.out.lock().unwrap().is_empty());
    }

    #[test]
    fn test_write_error_counted() {
        let proto = SinkProtocol { fail: true, ..Default::default() };
        let mut buffers = CoreBuffers::new(64, 2, 0);
        let mut req = Request::new(AsyncId::new(0));
        let mut ctx = RequestContext::new(&mut req, &mut buffers, &proto);
        assert!(ctx.write_raw(b"x").is_err());
        assert_eq!(req.write_errors, 1);
    }

    #[test]
    fn test_payload_after_header() {
        let proto = SinkProtocol::default();
        let mut buffers = CoreBuffers::new(32, 2, 0);
        buffers.buffer[..9].copy_from_slice(b"head\n\nabc");
        let mut req = Request::new(AsyncId::new(0));
        req.pktsize = 9;
        req.header_len = 6;
        let ctx = RequestContext::new(&mut req, &mut buffers, &proto);
        assert_eq!(ctx.payload(), b"abc");
    }
}
