//! Process memory sampling

use vassal_core::{CoreError, CoreResult};

/// Resident set and address-space size of the calling process, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub rss: u64,
    pub vsz: u64,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn page_size() -> u64 {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 {
                size as u64
            } else {
                4096
            }
        }

        /// Parse the first two fields of `/proc/self/statm` (pages)
        fn parse_statm(text: &str, page: u64) -> Option<MemoryUsage> {
            let mut fields = text.split_whitespace();
            let size: u64 = fields.next()?.parse().ok()?;
            let resident: u64 = fields.next()?.parse().ok()?;
            Some(MemoryUsage {
                rss: resident * page,
                vsz: size * page,
            })
        }

        pub fn sample() -> CoreResult<MemoryUsage> {
            let text = std::fs::read_to_string("/proc/self/statm")?;
            parse_statm(&text, page_size()).ok_or(CoreError::Os(libc::EINVAL))
        }
    } else {
        /// Address space is not reported here; rss comes from getrusage
        pub fn sample() -> CoreResult<MemoryUsage> {
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
                return Err(CoreError::last_os_error());
            }
            Ok(MemoryUsage { rss: usage.ru_maxrss as u64, vsz: 0 })
        }
    }
}
