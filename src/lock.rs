//! Bounded-wait mutual exclusion for the shared work files.
//!
//! A [`Lock`] is either an advisory `flock` on a file, which excludes other
//! threads and other farm processes sharing the filesystem, or an in-process
//! mutex for a work directory only one farm uses. Either way the guard
//! returned by [`Lock::acquire`] releases on drop, so every exit path unlocks.

use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error};

use crate::error::{FarmError, Result};

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum Lock {
    File {
        path: PathBuf,
        wait: Duration,
    },
    /// Shares `mutex` with every other lock handed out under the same name.
    Memory {
        name: PathBuf,
        mutex: Arc<Mutex<()>>,
        wait: Duration,
    },
}

/// Held lock; dropping it releases.
#[derive(Debug)]
pub enum LockGuard<'a> {
    File(File),
    Memory(MutexGuard<'a, ()>),
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let LockGuard::File(file) = self {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

impl Lock {
    pub fn file(path: impl Into<PathBuf>, wait: Duration) -> Self {
        Lock::File {
            path: path.into(),
            wait,
        }
    }

    pub fn memory(name: impl Into<PathBuf>, mutex: Arc<Mutex<()>>, wait: Duration) -> Self {
        Lock::Memory {
            name: name.into(),
            mutex,
            wait,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Lock::File { path, .. } => path,
            Lock::Memory { name, .. } => name,
        }
    }

    /// Polls for the lock until the wait window runs out.
    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        match self {
            Lock::File { path, wait } => acquire_file(path, *wait),
            Lock::Memory { name, mutex, wait } => acquire_memory(name, mutex, *wait),
        }
    }
}

fn acquire_file(path: &Path, wait: Duration) -> Result<LockGuard<'static>> {
    // Never truncate: another holder may be mid-operation on the same inode.
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| FarmError::io(path, e))?;

    let fd = file.as_raw_fd();
    let deadline = Instant::now() + wait;
    loop {
        let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(LockGuard::File(file));
        }
        if Instant::now() >= deadline {
            error!("Unable to lock '{}' after {:?}.", path.display(), wait);
            return Err(timeout(path, wait));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn acquire_memory<'a>(name: &Path, mutex: &'a Mutex<()>, wait: Duration) -> Result<LockGuard<'a>> {
    let deadline = Instant::now() + wait;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(LockGuard::Memory(guard)),
            // The protected state lives on disk; a panicked holder leaves nothing half-written in memory.
            Err(TryLockError::Poisoned(poisoned)) => {
                debug!("Recovering poisoned lock '{}'.", name.display());
                return Ok(LockGuard::Memory(poisoned.into_inner()));
            }
            Err(TryLockError::WouldBlock) => {}
        }
        if Instant::now() >= deadline {
            error!("Unable to lock '{}' after {:?}.", name.display(), wait);
            return Err(timeout(name, wait));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn timeout(path: &Path, wait: Duration) -> FarmError {
    FarmError::LockTimeout {
        path: path.to_path_buf(),
        waited: wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn file_lock_excludes_second_holder_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let first = Lock::file(&path, Duration::from_millis(50));
        let second = Lock::file(&path, Duration::from_millis(50));

        let guard = first.acquire().unwrap();
        let err = second.acquire().unwrap_err();
        assert!(err.is_lock_timeout());

        drop(guard);
        assert!(second.acquire().is_ok());
    }

    #[test]
    fn memory_locks_sharing_a_mutex_exclude_each_other() {
        let mutex = Arc::new(Mutex::new(()));
        let first = Lock::memory("list", Arc::clone(&mutex), Duration::from_millis(20));
        let second = Lock::memory("list", mutex, Duration::from_millis(20));

        let guard = first.acquire().unwrap();
        assert!(second.acquire().unwrap_err().is_lock_timeout());
        drop(guard);
        assert!(second.acquire().is_ok());
    }

    #[test]
    fn file_lock_serializes_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("lock"));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = Arc::clone(&path);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let lock = Lock::file(path.as_path(), DEFAULT_LOCK_WAIT);
                    for _ in 0..20 {
                        let _guard = lock.acquire().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_micros(200));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
