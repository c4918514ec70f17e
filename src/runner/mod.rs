//! Strategies for executing a task's command line.
//!
//! A [`Runner`] only decides how the child process is built; spawning,
//! output redirection, waiting and termination are shared by all runners.
//! Runners are looked up by name in a [`RunnerRegistry`].

pub mod container;
pub mod shell;

use std::{
    collections::BTreeMap,
    fs::File,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use thiserror::Error;

use crate::{
    config::{Config, Definition, Settings},
    context::Termination,
    error::{FarmError, Result},
    models::task::Task,
};

pub use container::ContainerRunner;
pub use shell::ShellRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited { pid: u32, exit_code: i32 },
    Terminated { pid: u32 },
}

#[derive(Debug, Error)]
pub enum RunError {
    /// No child process exists; the task never ran.
    #[error("unable to start: {0}")]
    Spawn(#[source] io::Error),

    /// Waiting on or terminating a started child failed. The child's process
    /// group has been killed and reaped.
    #[error("lost track of pid {pid}: {source}")]
    Supervise {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    /// The child process that executes `task`.
    fn command(&self, task: &Task) -> Command;

    /// Runs `task` with stdout and stderr appended to `log`, blocking until
    /// the child exits or `termination` fires.
    fn run(
        &self,
        task: &Task,
        log: File,
        termination: &Termination,
        grace: Duration,
    ) -> std::result::Result<RunStatus, RunError> {
        let stderr = log.try_clone().map_err(RunError::Spawn)?;
        let mut command = self.command(task);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            // Own process group: terminal interrupts reach the farm, not the task.
            .process_group(0);

        let mut child = command.spawn().map_err(RunError::Spawn)?;
        let pid = child.id();
        debug!("Task {} running as pid {} via runner '{}'.", task.id, pid, self.name());

        supervise(self, task, &mut child, termination, grace).map_err(|source| {
            error!("Lost track of task {} (pid {}): {}, killing it.", task.id, pid, source);
            signal_group(pid, libc::SIGKILL);
            if let Err(e) = child.wait() {
                warn!("Unable to reap pid {}: {}", pid, e);
            }
            RunError::Supervise { pid, source }
        })
    }

    /// SIGTERM to the child's process group, then SIGKILL once `grace` runs
    /// out or `termination` turns urgent.
    fn terminate(&self, child: &mut Child, termination: &Termination, grace: Duration) -> io::Result<ExitStatus> {
        let pid = child.id();
        signal_group(pid, libc::SIGTERM);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !termination.is_urgent() {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!("Process group {} still running, killing it.", pid);
        signal_group(pid, libc::SIGKILL);
        child.wait()
    }
}

fn supervise<R: Runner + ?Sized>(
    runner: &R,
    task: &Task,
    child: &mut Child,
    termination: &Termination,
    grace: Duration,
) -> io::Result<RunStatus> {
    let pid = child.id();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(RunStatus::Exited {
                pid,
                exit_code: exit_code(status),
            });
        }
        if termination.is_set() {
            let status = runner.terminate(child, termination, grace)?;
            debug!("Task {} terminated with {:?}.", task.id, status);
            return Ok(RunStatus::Terminated { pid });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn signal_group(pid: u32, signo: libc::c_int) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), signo);
    }
}

/// Exit code of a finished child; death by signal maps to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

pub type RunnerConstructor = fn(name: &str, settings: &Settings) -> Result<Arc<dyn Runner>>;

/// Runner kinds and named runner definitions.
pub struct RunnerRegistry {
    kinds: BTreeMap<String, RunnerConstructor>,
    named: BTreeMap<String, Definition>,
}

impl RunnerRegistry {
    /// `default` runs commands through `sh -c`, `bash` through `bash -c`.
    pub fn builtin() -> Self {
        let mut registry = RunnerRegistry {
            kinds: BTreeMap::new(),
            named: BTreeMap::new(),
        };
        registry.register_kind("shell", ShellRunner::from_settings);
        registry.register_kind("container", ContainerRunner::from_settings);

        let mut bash = Settings::default();
        bash.insert("shell", "bash");
        registry.define("default", Definition {
            kind: "shell".to_string(),
            settings: Settings::default(),
        });
        registry.define("bash", Definition {
            kind: "shell".to_string(),
            settings: bash,
        });
        registry
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        for (name, def) in &config.runners {
            self.define(name, def.clone());
        }
        self
    }

    pub fn register_kind(&mut self, kind: &str, constructor: RunnerConstructor) {
        self.kinds.insert(kind.to_string(), constructor);
    }

    pub fn define(&mut self, name: &str, def: Definition) {
        self.named.insert(name.to_string(), def);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Runner>> {
        let def = self.named.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            FarmError::NotFound(format!("runner '{}' (known: {})", name, known.join(", ")))
        })?;
        let constructor = self
            .kinds
            .get(&def.kind)
            .ok_or_else(|| FarmError::NotFound(format!("runner kind '{}' (used by runner '{}')", def.kind, name)))?;
        constructor(name, &def.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FarmContext;

    fn run_with(runner: &dyn Runner, command: &str) -> (RunStatus, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = File::create(&path).unwrap();
        let ctx = FarmContext::new(dir.path());
        let status = runner
            .run(&Task::new(0, command), log, &ctx.termination(), Duration::from_secs(1))
            .unwrap();
        (status, std::fs::read_to_string(path).unwrap())
    }

    #[test]
    fn captures_stdout_and_stderr_in_log() {
        let runner = RunnerRegistry::builtin().create("default").unwrap();
        let (status, log) = run_with(runner.as_ref(), "echo out; echo err >&2; exit 3");
        assert!(matches!(status, RunStatus::Exited { exit_code: 3, .. }));
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }

    #[test]
    fn signal_death_maps_above_128() {
        let runner = RunnerRegistry::builtin().create("bash").unwrap();
        let (status, _) = run_with(runner.as_ref(), "kill -9 $$");
        assert!(matches!(status, RunStatus::Exited { exit_code: 137, .. }));
    }

    #[test]
    fn termination_kills_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let log = File::create(dir.path().join("log")).unwrap();
        let ctx = FarmContext::new(dir.path());
        let termination = ctx.termination();
        let runner = RunnerRegistry::builtin().create("default").unwrap();

        let trigger = termination.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.fire();
        });

        let started = Instant::now();
        let status = runner
            .run(&Task::new(0, "sleep 30"), log, &termination, Duration::from_secs(1))
            .unwrap();
        timer.join().unwrap();

        assert!(matches!(status, RunStatus::Terminated { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn urgent_termination_skips_grace() {
        let dir = tempfile::tempdir().unwrap();
        let log = File::create(dir.path().join("log")).unwrap();
        let ctx = Arc::new(FarmContext::new(dir.path()));
        let termination = ctx.termination();
        let runner = RunnerRegistry::builtin().create("default").unwrap();

        let killer = Arc::clone(&ctx);
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            killer.request_shutdown();
            thread::sleep(Duration::from_millis(300));
            killer.request_kill();
        });

        let started = Instant::now();
        let status = runner
            .run(&Task::new(0, "trap '' TERM; sleep 30"), log, &termination, Duration::from_secs(60))
            .unwrap();
        timer.join().unwrap();

        assert!(matches!(status, RunStatus::Terminated { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// Shell runner whose termination always fails.
    struct Stubborn;

    impl Runner for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn command(&self, task: &Task) -> Command {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&task.command);
            command
        }

        fn terminate(&self, _child: &mut Child, _termination: &Termination, _grace: Duration) -> io::Result<ExitStatus> {
            Err(io::Error::other("wait failed"))
        }
    }

    #[test]
    fn failed_supervision_kills_and_reaps_child() {
        let dir = tempfile::tempdir().unwrap();
        let log = File::create(dir.path().join("log")).unwrap();
        let ctx = FarmContext::new(dir.path());
        let termination = ctx.termination();
        termination.fire();

        let err = Stubborn
            .run(&Task::new(0, "sleep 30"), log, &termination, Duration::from_secs(1))
            .unwrap_err();
        let pid = match err {
            RunError::Supervise { pid, .. } => pid,
            other => panic!("unexpected error {:?}", other),
        };
        // Reaped: the pid no longer names a process of ours.
        assert_eq!(unsafe { libc::kill(pid as libc::pid_t, 0) }, -1);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = File::create(dir.path().join("log")).unwrap();
        let ctx = FarmContext::new(dir.path());
        let runner = ShellRunner::new("broken", "/nonexistent/shell");

        let err = runner
            .run(&Task::new(0, "true"), log, &ctx.termination(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn(_)));
    }

    #[test]
    fn unknown_runner_is_not_found() {
        let registry = RunnerRegistry::builtin();
        match registry.create("slurm") {
            Err(FarmError::NotFound(message)) => assert!(message.contains("known: bash, default")),
            other => panic!("unexpected {:?}", other.map(|r| r.name().to_string())),
        }
    }

    #[test]
    fn configured_runners_join_builtins() {
        let mut config = Config::default();
        let mut settings = Settings::default();
        settings.insert("image", "ubuntu:24.04");
        config.runners.insert("ubuntu".to_string(), Definition {
            kind: "container".to_string(),
            settings,
        });

        let registry = RunnerRegistry::builtin().with_config(&config);
        assert_eq!(registry.create("ubuntu").unwrap().name(), "ubuntu");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["bash", "default", "ubuntu"]);
    }
}
