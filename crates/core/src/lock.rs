use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt as _;
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Advisory, timeout-bounded exclusive lock bound to a named sidecar file.
///
/// Guards both in-process contention, via a per-path [`Mutex`] shared by every
/// clone of the resolved path, and same-host multi-process contention, via an
/// OS-level advisory lock ([`fs2`]) on a handle to the sidecar's lock file.
/// The lock is released on every exit path, including panics, by `Drop`.
#[derive(Clone)]
pub struct FileLock {
    path: Arc<Path>,
    inproc: Arc<Mutex<()>>,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Arc::from(path.into()), inproc: Arc::new(Mutex::new(())) }
    }

    /// Acquire the lock, blocking and polling until `timeout` elapses.
    pub fn acquire(&self, timeout: Duration) -> Result<FileLockGuard<'_>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage_io(parent, e))?;
        }

        // Guarantee in-process exclusivity first; holding this across the
        // whole OS-lock acquisition loop keeps one thread per path polling
        // at a time, rather than every waiter hammering `try_lock_exclusive`.
        let inproc_guard = acquire_with_timeout(&self.inproc, timeout, &self.path)?;

        let file = File::create(&*self.path).map_err(|e| Error::storage_io(&*self.path, e))?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(FileLockGuard { _inproc: inproc_guard, file, path: self.path.clone() });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(_) => return Err(Error::LockTimeout(timeout, self.path.to_path_buf())),
            }
        }
    }

    pub fn acquire_default(&self) -> Result<FileLockGuard<'_>> {
        self.acquire(DEFAULT_TIMEOUT)
    }
}

fn acquire_with_timeout<'a>(
    mutex: &'a Mutex<()>,
    timeout: Duration,
    path: &Path,
) -> Result<parking_lot::MutexGuard<'a, ()>> {
    mutex.try_lock_for(timeout).ok_or_else(|| Error::LockTimeout(timeout, path.to_path_buf()))
}

/// RAII guard releasing both the in-process and the OS-level lock on drop.
pub struct FileLockGuard<'a> {
    _inproc: parking_lot::MutexGuard<'a, ()>,
    file: File,
    path: Arc<Path>,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release advisory lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn acquire_and_release_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("sidecar.lock"));
        {
            let _g = lock.acquire_default().unwrap();
        }
        let _g2 = lock.acquire_default().unwrap();
    }

    #[test]
    fn contention_is_serialized_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("sidecar.lock"));
        let counter = StdArc::new(AtomicUsize::new(0));
        let max_seen = StdArc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let lock = lock.clone();
                let counter = counter.clone();
                let max_seen = max_seen.clone();
                s.spawn(move || {
                    let _g = lock.acquire(Duration::from_secs(5)).unwrap();
                    let cur = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(cur, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_surfaces_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.lock");
        let lock = FileLock::new(&path);
        let _g = lock.acquire_default().unwrap();

        let other = FileLock::new(&path);
        let err = other.acquire(Duration::from_millis(50));
        assert!(matches!(err, Err(Error::LockTimeout(..))));
    }
}
