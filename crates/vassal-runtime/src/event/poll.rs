//! poll(2)-backed queue, available on every Unix

use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use vassal_core::{last_errno, CoreError, CoreResult, EventQueue};

pub struct PollQueue {
    fds: Mutex<Vec<RawFd>>,
}

impl PollQueue {
    pub fn new() -> CoreResult<Self> {
        Ok(Self {
            fds: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<libc::pollfd> {
        let fds = self.fds.lock().unwrap_or_else(|e| e.into_inner());
        fds.iter()
            .map(|fd| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect()
    }
}

impl EventQueue for PollQueue {
    fn add_read(&self, fd: RawFd) -> CoreResult<()> {
        let mut fds = self.fds.lock().unwrap_or_else(|e| e.into_inner());
        if !fds.contains(&fd) {
            fds.push(fd);
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> CoreResult<()> {
        let mut fds = self.fds.lock().unwrap_or_else(|e| e.into_inner());
        fds.retain(|f| *f != fd);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> CoreResult<Option<RawFd>> {
        let mut pfds = self.snapshot();
        let ret = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                super::timeout_ms(timeout),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(None);
            }
            return Err(CoreError::EventQueue(errno));
        }
        Ok(pfds
            .iter()
            .find(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|p| p.fd))
    }
}
