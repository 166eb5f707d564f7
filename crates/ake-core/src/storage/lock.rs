//! Per-key advisory file locks.
//!
//! Each read/modify/write key has its own `<target>.lock` file, so writers
//! of unrelated keys never contend. Write-once keys take no lock at all.
//! Acquisition polls a non-blocking `flock` for a bounded time per attempt
//! and backs off exponentially (with jitter) between attempts; running out
//! of attempts is reported, never swallowed.

use super::StorageError;
use ake_config::LockSettings;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Path of the lock file guarding `target`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// Held exclusive lock on one store key; released on drop.
#[derive(Debug)]
pub struct KeyLock {
    file: File,
    path: PathBuf,
}

impl KeyLock {
    /// Acquire the lock for `key`, retrying per `settings`.
    pub fn acquire(path: &Path, key: &str, settings: &LockSettings) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Keep lock file contents (advisory lock only)
            .open(path)
            .map_err(|e| StorageError::io("open lock", key, e))?;

        let attempts = settings.lock_attempts.max(1);
        for attempt in 0..attempts {
            let deadline = Instant::now() + settings.attempt_timeout();
            loop {
                if try_lock_exclusive(&file).map_err(|e| StorageError::io("lock", key, e))? {
                    trace!(key, attempt, "lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }

            if attempt + 1 < attempts {
                let delay = jittered(settings.backoff(attempt));
                debug!(
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "lock busy, backing off"
                );
                thread::sleep(delay);
            }
        }

        Err(StorageError::ConcurrencyExhausted {
            key: key.to_string(),
            attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Spread retries of processes that collided at the same instant.
fn jittered(base: Duration) -> Duration {
    let ms = base.as_millis() as u64;
    if ms == 0 {
        return base;
    }
    let jitter = rand::rng().random_range(0..=ms / 2);
    Duration::from_millis(ms + jitter)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // LOCK_EX = Exclusive lock
    // LOCK_NB = Non-blocking (fail if held)
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

// On non-unix we just hold the file handle (basic locking).
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // Best effort unlock
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        // The lock file is never removed: deleting it would let a waiter lock
        // an unlinked inode while a newcomer locks a fresh file.
    }
}
