//! Readiness queues
//!
//! Each accepting thread owns one queue holding the listening sockets and
//! its signal descriptors; the async engine adds request connections too.

mod poll;
pub use poll::PollQueue;

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollQueue;
        pub use epoll::EpollQueue as PlatformEventQueue;
    } else {
        pub use poll::PollQueue as PlatformEventQueue;
    }
}

use std::time::Duration;

/// Convert an optional timeout to the millisecond form poll/epoll expect
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so sub-millisecond waits do not spin
            let ms = d.as_micros().div_ceil(1000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use vassal_core::EventQueue;

    #[test]
    fn test_timeout_ms() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_secs(5))), 5000);
    }

    fn exercise(queue: &dyn EventQueue) {
        let (mut a, b) = UnixStream::pair().unwrap();
        queue.add_read(b.as_raw_fd()).unwrap();
        assert_eq!(queue.wait(Some(Duration::from_millis(10))).unwrap(), None);

        a.write_all(b"x").unwrap();
        assert_eq!(
            queue.wait(Some(Duration::from_millis(500))).unwrap(),
            Some(b.as_raw_fd())
        );

        queue.remove(b.as_raw_fd()).unwrap();
        assert_eq!(queue.wait(Some(Duration::from_millis(10))).unwrap(), None);
    }

    #[test]
    fn test_platform_queue() {
        let queue = PlatformEventQueue::new().unwrap();
        exercise(&queue);
    }

    #[test]
    fn test_poll_queue() {
        let queue = PollQueue::new().unwrap();
        exercise(&queue);
    }
}
