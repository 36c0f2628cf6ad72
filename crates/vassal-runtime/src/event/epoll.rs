//! epoll-backed queue (level-triggered)

use std::os::fd::RawFd;
use std::time::Duration;

use vassal_core::{last_errno, CoreError, CoreResult, EventQueue};

pub struct EpollQueue {
    epfd: RawFd,
}

impl EpollQueue {
    pub fn new() -> CoreResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(CoreError::EventQueue(last_errno()));
        }
        Ok(Self { epfd })
    }
}

impl EventQueue for EpollQueue {
    fn add_read(&self, fd: RawFd) -> CoreResult<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            let errno = last_errno();
            if errno != libc::EEXIST {
                return Err(CoreError::EventQueue(errno));
            }
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> CoreResult<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if ret < 0 {
            let errno = last_errno();
            // Already gone (closed or never added)
            if errno != libc::ENOENT && errno != libc::EBADF {
                return Err(CoreError::EventQueue(errno));
            }
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> CoreResult<Option<RawFd>> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe { libc::epoll_wait(self.epfd, &mut ev, 1, super::timeout_ms(timeout)) };
        if ret < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(None);
            }
            return Err(CoreError::EventQueue(errno));
        }
        if ret == 0 {
            return Ok(None);
        }
        let data = ev.u64;
        Ok(Some(data as RawFd))
    }
}

impl Drop for EpollQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
