//! Shared, explicit state for one farm run.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    env, fs,
    hash::{Hash, Hasher},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use log::debug;

use crate::{
    error::{FarmError, Result},
    lock::{Lock, DEFAULT_LOCK_WAIT},
};

/// Alternate directory for lock files, for work directories on filesystems
/// without `flock` support.
pub const LOCK_AREA_ENV: &str = "FARMER_LOCK_AREA";

pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Everything a farm component needs to know about the run it belongs to.
#[derive(Debug)]
pub struct FarmContext {
    workdir: PathBuf,
    lock_area: Option<PathBuf>,
    /// In-process locks by name, when no other farm shares the work directory.
    memory_locks: Option<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    pub lock_wait: Duration,
    /// Time between SIGTERM and SIGKILL when a running task is terminated.
    pub termination_grace: Duration,
    shutdown: Arc<AtomicBool>,
    urgent: Arc<AtomicBool>,
}

impl FarmContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        FarmContext {
            workdir: workdir.into(),
            lock_area: env::var_os(LOCK_AREA_ENV).map(PathBuf::from),
            memory_locks: None,
            lock_wait: DEFAULT_LOCK_WAIT,
            termination_grace: DEFAULT_TERMINATION_GRACE,
            shutdown: Arc::new(AtomicBool::new(false)),
            urgent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_lock_area(mut self, lock_area: Option<PathBuf>) -> Self {
        self.lock_area = lock_area;
        self
    }

    /// Single-node runs: locks are process-local mutexes instead of `flock`.
    pub fn with_memory_locks(mut self, enabled: bool) -> Self {
        self.memory_locks = enabled.then(Mutex::default);
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.workdir.join("logs")
    }

    pub fn task_log(&self, task_id: u64) -> PathBuf {
        self.log_dir().join(format!("log_{}", task_id))
    }

    pub fn timeline_path(&self) -> PathBuf {
        self.workdir.join("timeline.json")
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.workdir.join("cursor")
    }

    pub fn requeued_path(&self) -> PathBuf {
        self.workdir.join("requeued")
    }

    pub fn completed_path(&self) -> PathBuf {
        self.workdir.join("completed")
    }

    /// Creates the work and log directories. Another node creating them at
    /// the same moment is not an error.
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [self.workdir.clone(), self.log_dir()] {
            match fs::create_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(FarmError::io(dir, e)),
            }
        }
        debug!("Work directory ready at '{}'.", self.workdir.display());
        Ok(())
    }

    /// Lock guarding the named shared file (`lock` for the task list,
    /// `timeline.lock` for the timeline).
    pub fn lock(&self, name: &str) -> Lock {
        if let Some(locks) = &self.memory_locks {
            let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
            let mutex = locks.entry(name.to_string()).or_default();
            return Lock::memory(self.workdir.join(name), Arc::clone(mutex), self.lock_wait);
        }

        let path = match &self.lock_area {
            None => self.workdir.join(name),
            Some(area) => {
                let absolute = fs::canonicalize(&self.workdir).unwrap_or_else(|_| self.workdir.clone());
                let mut hasher = DefaultHasher::new();
                absolute.hash(&mut hasher);
                area.join(format!("{:016x}_{}", hasher.finish(), name))
            }
        };
        Lock::file(path, self.lock_wait)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Skips what is left of the termination grace: running tasks are killed
    /// outright.
    pub fn request_kill(&self) {
        self.request_shutdown();
        self.urgent.store(true, Ordering::SeqCst);
    }

    /// A fresh forced-termination token for one worker, tied to this farm's
    /// shutdown flag.
    pub fn termination(&self) -> Termination {
        Termination {
            own: Arc::new(AtomicBool::new(false)),
            farm: Arc::clone(&self.shutdown),
            urgent: Arc::clone(&self.urgent),
        }
    }
}

/// Forced-termination request for a single worker. Set either directly or by
/// the farm-wide shutdown.
#[derive(Debug, Clone)]
pub struct Termination {
    own: Arc<AtomicBool>,
    farm: Arc<AtomicBool>,
    urgent: Arc<AtomicBool>,
}

impl Termination {
    pub fn fire(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.own.load(Ordering::SeqCst) || self.farm.load(Ordering::SeqCst)
    }

    /// No grace period left: kill instead of asking politely.
    pub fn is_urgent(&self) -> bool {
        self.urgent.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_dirs_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = FarmContext::new(dir.path().join("run")).with_lock_area(None);
        ctx.prepare_dirs().unwrap();
        ctx.prepare_dirs().unwrap();
        assert!(ctx.log_dir().is_dir());
        assert_eq!(ctx.task_log(7), dir.path().join("run/logs/log_7"));
    }

    #[test]
    fn lock_area_moves_lock_files_out_of_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let area = tempfile::tempdir().unwrap();
        let ctx = FarmContext::new(dir.path()).with_lock_area(Some(area.path().to_path_buf()));

        let lock = ctx.lock("lock");
        assert!(lock.path().starts_with(area.path()));
        assert!(lock.path().to_string_lossy().ends_with("_lock"));
        assert_eq!(ctx.lock("lock").path(), lock.path());
    }

    #[test]
    fn memory_locks_are_shared_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = FarmContext::new(dir.path())
            .with_memory_locks(true)
            .with_lock_wait(Duration::from_millis(20));

        let list = ctx.lock("lock");
        let held = list.acquire().unwrap();
        assert!(ctx.lock("lock").acquire().unwrap_err().is_lock_timeout());
        assert!(ctx.lock("timeline.lock").acquire().is_ok());
        drop(held);

        assert!(ctx.lock("lock").acquire().is_ok());
        assert!(!dir.path().join("lock").exists());
    }

    #[test]
    fn termination_follows_farm_shutdown() {
        let ctx = FarmContext::new("unused");
        let first = ctx.termination();
        let second = ctx.termination();

        first.fire();
        assert!(first.is_set());
        assert!(!second.is_set());

        ctx.request_shutdown();
        assert!(second.is_set());
        assert!(!second.is_urgent());

        ctx.request_kill();
        assert!(first.is_urgent() && second.is_urgent());
    }
}
