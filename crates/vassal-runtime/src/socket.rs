//! Listening sockets
//!
//! A [`ListenSocket`] does not own its descriptor: the master binds sockets
//! once and every forked worker builds its own view over the inherited fds.

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;
use vassal_core::{last_errno, AsyncId, CoreError, CoreResult, Protocol};

use crate::io::set_nonblocking;

/// One listening socket as seen by a worker
pub struct ListenSocket {
    fd: RawFd,
    name: String,
    edge_trigger: bool,
    /// Per-core "revisit without readiness" flags
    retry: Box<[AtomicBool]>,
    /// Per-core dedicated descriptors, when the socket fans out per thread
    thread_fds: Option<Box<[RawFd]>>,
    protocol: Arc<dyn Protocol>,
}

impl ListenSocket {
    pub fn new(fd: RawFd, name: impl Into<String>, protocol: Arc<dyn Protocol>, cores: usize) -> Self {
        Self {
            fd,
            name: name.into(),
            edge_trigger: false,
            retry: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            thread_fds: None,
            protocol,
        }
    }

    pub fn edge_triggered(mut self, enable: bool) -> Self {
        self.edge_trigger = enable;
        self
    }

    pub fn with_thread_fds(mut self, fds: Vec<RawFd>) -> Self {
        self.thread_fds = Some(fds.into_boxed_slice());
        self
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_edge_triggered(&self) -> bool {
        self.edge_trigger
    }

    #[inline]
    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    #[inline]
    pub fn needs_retry(&self, id: AsyncId) -> bool {
        self.retry
            .get(id.as_usize())
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_retry(&self, id: AsyncId, value: bool) {
        if let Some(flag) = self.retry.get(id.as_usize()) {
            flag.store(value, Ordering::Release);
        }
    }

    #[inline]
    pub fn thread_fd(&self, id: AsyncId) -> Option<RawFd> {
        self.thread_fds.as_ref()?.get(id.as_usize()).copied()
    }

    /// Does this socket own the ready descriptor (or a pending retry) for core `id`?
    pub fn matches(&self, ready: Option<RawFd>, id: AsyncId) -> bool {
        if ready == Some(self.fd) || self.needs_retry(id) {
            return true;
        }
        match (ready, self.thread_fd(id)) {
            (Some(r), Some(t)) => r == t,
            _ => false,
        }
    }

    /// Descriptors core `id` should watch for this socket
    pub fn watch_fds(&self, id: AsyncId) -> impl Iterator<Item = RawFd> {
        std::iter::once(self.fd).chain(self.thread_fd(id))
    }
}

/// Bind a listening socket.
///
/// Addresses containing `/` are Unix socket paths; anything else must parse
/// as `ip:port`. The returned descriptor is non-blocking.
pub fn bind_listener(addr: &str, backlog: i32) -> CoreResult<OwnedFd> {
    let fd: OwnedFd = if addr.contains('/') {
        let _ = std::fs::remove_file(addr);
        UnixListener::bind(addr)?.into()
    } else {
        let sock: SocketAddr = addr
            .parse()
            .map_err(|_| CoreError::Config("listen address must be ip:port or a path"))?;
        match sock {
            SocketAddr::V4(v4) => bind_tcp4(v4, backlog)?,
            SocketAddr::V6(_) => TcpListener::bind(sock)?.into(),
        }
    };
    let raw = fd.as_raw_fd();
    set_nonblocking(raw)?;
    info!(addr, fd = raw, "listening socket bound");
    Ok(fd)
}

/// Common IPv4 setup: create, SO_REUSEADDR, bind, listen
fn bind_tcp4(addr: std::net::SocketAddrV4, backlog: i32) -> CoreResult<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(CoreError::Os(last_errno()));
    }
    // Safety: fd is a fresh socket we own
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());

    let ret = unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&sin) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(CoreError::Os(last_errno()));
    }
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(CoreError::Os(last_errno()));
    }
    Ok(owned)
}
