//! Named, bounded, cross-process locks.
//!
//! A named lock is an exclusive advisory lock (`flock`) on a file under
//! `.autoheal/locks/`. Acquisition polls with exponential backoff until a
//! deadline; the guard releases the lock when dropped, on every exit path.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, trace, warn};

use crate::core::budget::next_backoff;

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {path} still held after {waited:?}")]
    Contended { path: PathBuf, waited: Duration },
    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        } else {
            trace!(path = %self.path.display(), "lock released");
        }
    }
}

/// Try once without waiting. `Ok(None)` means another holder has it.
pub fn try_acquire(path: &Path) -> Result<Option<LockGuard>, LockError> {
    let file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            trace!(path = %path.display(), "lock acquired");
            Ok(Some(LockGuard {
                file,
                path: path.to_path_buf(),
            }))
        }
        Err(err) if is_contention(&err) => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Acquire the lock, waiting at most `timeout`.
pub fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard, LockError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if let Some(guard) = try_acquire(path)? {
            return Ok(guard);
        }
        match next_backoff(backoff, MAX_BACKOFF, deadline) {
            Some(wait) => {
                thread::sleep(wait);
                backoff = wait;
            }
            None => {
                debug!(path = %path.display(), "lock acquisition timed out");
                return Err(LockError::Contended {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                });
            }
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)
}

fn is_contention(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_times_out_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("locks").join("a.lock");
        let held = acquire(&path, Duration::from_millis(50)).expect("first");
        let err = acquire(&path, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }));
        drop(held);
        acquire(&path, Duration::from_millis(50)).expect("after release");
    }

    #[test]
    fn try_acquire_reports_contention() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("b.lock");
        let _held = try_acquire(&path).expect("io").expect("free");
        assert!(try_acquire(&path).expect("io").is_none());
    }

    #[test]
    fn waiter_gets_lock_once_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("c.lock");
        let held = acquire(&path, Duration::from_millis(50)).expect("first");
        let waiter_path = path.clone();
        let waiter =
            thread::spawn(move || acquire(&waiter_path, Duration::from_secs(5)).map(|_| ()));
        thread::sleep(Duration::from_millis(30));
        drop(held);
        waiter.join().expect("join").expect("waiter acquires");
    }
}
