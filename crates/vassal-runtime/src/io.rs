//! Descriptor helpers shared by the accept loop and the protocols

use std::os::fd::RawFd;
use std::time::Duration;

use vassal_core::{last_errno, CoreError, CoreResult};

fn poll_one(fd: RawFd, events: libc::c_short, timeout: Duration) -> CoreResult<bool> {
    let ms = crate::event::timeout_ms(Some(timeout));
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(CoreError::Os(errno));
        }
        return Ok(ret > 0);
    }
}

/// Wait until `fd` is readable; false on timeout
pub fn wait_readable(fd: RawFd, timeout: Duration) -> CoreResult<bool> {
    poll_one(fd, libc::POLLIN, timeout)
}

/// Wait until `fd` is writable; false on timeout
pub fn wait_writable(fd: RawFd, timeout: Duration) -> CoreResult<bool> {
    poll_one(fd, libc::POLLOUT, timeout)
}

pub fn set_nonblocking(fd: RawFd) -> CoreResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(CoreError::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(CoreError::last_os_error());
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> CoreResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(CoreError::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(CoreError::last_os_error());
    }
    Ok(())
}

pub fn is_cloexec(fd: RawFd) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    flags >= 0 && flags & libc::FD_CLOEXEC != 0
}

/// Disable Nagle on a TCP socket. Fails with ENOTSUP/EOPNOTSUPP on
/// non-TCP sockets.
pub fn set_tcp_nodelay(fd: RawFd) -> CoreResult<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(CoreError::last_os_error());
    }
    Ok(())
}

/// Write all of `data`, waiting up to `timeout` whenever the socket is full
pub fn write_all(fd: RawFd, data: &[u8], timeout: Duration) -> CoreResult<usize> {
    let mut written = 0;
    while written < data.len() {
        let rest = &data[written..];
        let n = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if n < 0 {
            let errno = last_errno();
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    if !wait_writable(fd, timeout)? {
                        return Err(CoreError::Timeout);
                    }
                    continue;
                }
                _ => return Err(CoreError::Os(errno)),
            }
        }
        if n == 0 {
            return Err(CoreError::PeerClosed);
        }
        written += n as usize;
    }
    Ok(written)
}

#[inline]
pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Non-blocking SOCK_SEQPACKET pair, used for worker signal channels.
///
/// `bufsize` overrides both send and receive buffer sizes.
pub fn create_msg_pipe(bufsize: Option<usize>) -> CoreResult<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(CoreError::last_os_error());
    }
    for fd in fds {
        if let Err(e) = set_nonblocking(fd) {
            close_fd(fds[0]);
            close_fd(fds[1]);
            return Err(e);
        }
        if let Some(size) = bufsize {
            let size = size as libc::c_int;
            for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
                unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        opt,
                        &size as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    );
                }
            }
        }
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        assert!(!wait_readable(b.as_raw_fd(), Duration::from_millis(5)).unwrap());
        a.write_all(b"z").unwrap();
        assert!(wait_readable(b.as_raw_fd(), Duration::from_millis(500)).unwrap());
    }

    #[test]
    fn test_write_all_and_flags() {
        let (a, mut b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        set_cloexec(a.as_raw_fd()).unwrap();
        assert!(is_cloexec(a.as_raw_fd()));
        assert_eq!(write_all(a.as_raw_fd(), b"hello", Duration::from_secs(1)).unwrap(), 5);
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(set_tcp_nodelay(a.as_raw_fd()).is_err());
    }

    #[test]
    fn test_msg_pipe_keeps_boundaries() {
        let (a, b) = create_msg_pipe(Some(8192)).unwrap();
        assert_eq!(write_all(a, b"ab", Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(write_all(a, b"c", Duration::from_secs(1)).unwrap(), 1);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(b, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(n, 2);
        close_fd(a);
        close_fd(b);
    }
}
