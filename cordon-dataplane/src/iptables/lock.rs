//! The iptables lock.
//!
//! Other tools take the same file lock while they edit the rulesets,
//! so we must hold it across each restore batch. One lock instance is
//! shared by all table writers; tables applying in parallel serialize
//! only on the kernel call itself.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug)]
pub struct SharedLock {
    path: PathBuf,
    timeout: Duration,
    probe_interval: Duration,
}

/// Held lock; unlocks on drop.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
}

impl SharedLock {
    pub fn new(path: &Path, timeout: Duration, probe_interval: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout,
            probe_interval,
        }
    }

    /// Acquire the lock, probing until the timeout elapses. A zero
    /// timeout disables locking entirely (the backend's own locking
    /// is assumed to cover us).
    pub fn acquire(&self) -> io::Result<Option<LockGuard>> {
        if self.timeout.is_zero() {
            return Ok(None);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.path)?;
            let rc = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX | nix::libc::LOCK_NB) };
            if rc == 0 {
                debug!(path = %self.path.display(), "acquired iptables lock");
                return Ok(Some(LockGuard { _file: file }));
            }

            if Instant::now() >= deadline {
                warn!(path = %self.path.display(), "timed out waiting for iptables lock");
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for iptables lock",
                ));
            }
            std::thread::sleep(self.probe_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_disables_locking() {
        let lock = SharedLock::new(
            Path::new("/nonexistent/never-created"),
            Duration::ZERO,
            Duration::from_millis(10),
        );
        assert!(lock.acquire().unwrap().is_none());
    }

    #[test]
    fn acquires_and_releases() {
        let path = std::env::temp_dir().join("cordon-lock-test");
        let lock = SharedLock::new(&path, Duration::from_secs(1), Duration::from_millis(10));
        let guard = lock.acquire().unwrap();
        assert!(guard.is_some());
        drop(guard);
        // Re-acquirable after release.
        assert!(lock.acquire().unwrap().is_some());
        let _ = std::fs::remove_file(&path);
    }
}
