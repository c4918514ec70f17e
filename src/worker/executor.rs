//! One claim/run/record cycle of a worker.

use std::{fs::File, sync::Arc};

use chrono::Utc;
use crossbeam_channel::Sender;
use log::{error, info, warn};

use crate::{
    context::{FarmContext, Termination},
    error::{FarmError, Result},
    models::{
        message::WorkerEvent,
        task::{RunResult, Task},
    },
    runner::{RunError, RunStatus, Runner},
    tasklist::TaskList,
};

/// Exit code recorded when a task's process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Lock windows a finished task's bookkeeping may wait through.
const RECORD_ATTEMPTS: usize = 3;

#[derive(Debug, PartialEq)]
pub enum SlotOutcome {
    /// Nothing was claimed: the list is exhausted, the claim timed out on the
    /// lock, or termination was already requested.
    Idle,
    Completed(RunResult),
    /// The claimed task went back to the list: termination hit, the run was
    /// lost, or its result could not be recorded.
    Requeued(u64),
}

pub struct Executor {
    ctx: Arc<FarmContext>,
    tasks: Arc<TaskList>,
    runner: Arc<dyn Runner>,
}

impl Executor {
    pub fn new(ctx: Arc<FarmContext>, tasks: Arc<TaskList>, runner: Arc<dyn Runner>) -> Self {
        Executor { ctx, tasks, runner }
    }

    pub fn tasks(&self) -> &Arc<TaskList> {
        &self.tasks
    }

    pub fn run_slot(&self, worker_id: usize, termination: &Termination, events: &Sender<WorkerEvent>) -> Result<SlotOutcome> {
        if termination.is_set() {
            return Ok(SlotOutcome::Idle);
        }

        let task = match self.tasks.claim_next() {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(SlotOutcome::Idle),
            Err(e) if e.is_lock_timeout() => {
                warn!("Worker {} could not claim a task: {}", worker_id, e);
                return Ok(SlotOutcome::Idle);
            }
            Err(e) => return Err(e),
        };

        if termination.is_set() {
            return self.requeue(worker_id, &task);
        }

        let log_path = self.ctx.task_log(task.id);
        let log = match File::create(&log_path) {
            Ok(log) => log,
            Err(e) => {
                self.with_lock_retries(|| self.tasks.record_requeue(task.id))?;
                return Err(FarmError::io(log_path, e));
            }
        };

        let _ = events.send(WorkerEvent::Started {
            worker_id,
            task_id: task.id,
            command: task.command.clone(),
        });

        let start_time = Utc::now();
        let status = self.runner.run(&task, log, termination, self.ctx.termination_grace);
        let end_time = Utc::now();

        let (pid, exit_code) = match status {
            Ok(RunStatus::Exited { pid, exit_code }) => (pid, exit_code),
            Ok(RunStatus::Terminated { .. }) => return self.requeue(worker_id, &task),
            Err(RunError::Spawn(e)) => {
                error!(
                    "Task {} could not be started by runner '{}': {}",
                    task.id,
                    self.runner.name(),
                    e
                );
                (0, SPAWN_FAILURE_EXIT_CODE)
            }
            Err(e @ RunError::Supervise { .. }) => {
                error!("Task {} did not run to completion: {}", task.id, e);
                return self.requeue(worker_id, &task);
            }
        };

        if let Err(e) = self.with_lock_retries(|| self.tasks.record_done(task.id, exit_code)) {
            error!(
                "Task {} exited with {} but could not be recorded ({}), requeueing it.",
                task.id, exit_code, e
            );
            return self.requeue(worker_id, &task);
        }
        Ok(SlotOutcome::Completed(RunResult {
            task_id: task.id,
            command: task.command,
            worker_id,
            pid,
            start_time,
            end_time,
            exit_code,
        }))
    }

    fn requeue(&self, worker_id: usize, task: &Task) -> Result<SlotOutcome> {
        self.with_lock_retries(|| self.tasks.record_requeue(task.id))?;
        info!("Worker {} gave up task {}, requeued.", worker_id, task.id);
        Ok(SlotOutcome::Requeued(task.id))
    }

    /// Runs a task-list update, trying again while the list lock stays busy.
    fn with_lock_retries(&self, update: impl Fn() -> Result<()>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match update() {
                Err(e) if e.is_lock_timeout() && attempt < RECORD_ATTEMPTS => {
                    warn!("Task list busy (attempt {} of {}): {}", attempt, RECORD_ATTEMPTS, e);
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::task::TaskStatus,
        runner::{RunnerRegistry, ShellRunner},
    };
    use crossbeam_channel::unbounded;
    use std::{
        fs, io,
        path::Path,
        process::{Child, Command, ExitStatus},
        thread,
        time::{Duration, Instant},
    };

    fn executor(dir: &Path, commands: &[&str], runner: Arc<dyn Runner>) -> Executor {
        executor_with(
            FarmContext::new(dir)
                .with_lock_area(None)
                .with_termination_grace(Duration::from_millis(500)),
            commands,
            runner,
        )
    }

    fn executor_with(ctx: FarmContext, commands: &[&str], runner: Arc<dyn Runner>) -> Executor {
        let ctx = Arc::new(ctx);
        ctx.prepare_dirs().unwrap();
        let tasks = commands
            .iter()
            .enumerate()
            .map(|(id, command)| Task::new(id as u64, *command))
            .collect();
        Executor::new(Arc::clone(&ctx), Arc::new(TaskList::new(tasks, ctx)), runner)
    }

    #[test]
    fn completes_task_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RunnerRegistry::builtin().create("default").unwrap();
        let executor = executor(dir.path(), &["echo hello; exit 4"], runner);
        let (tx, rx) = unbounded();
        let termination = executor.ctx.termination();

        let outcome = executor.run_slot(2, &termination, &tx).unwrap();
        let result = match outcome {
            SlotOutcome::Completed(result) => result,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(result.task_id, 0);
        assert_eq!(result.worker_id, 2);
        assert_eq!(result.exit_code, 4);
        assert!(result.end_time >= result.start_time);
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Started { task_id: 0, .. })));

        let log = fs::read_to_string(dir.path().join("logs/log_0")).unwrap();
        assert_eq!(log.trim(), "hello");
        assert_eq!(executor.tasks().status(0).unwrap(), TaskStatus::Failed(4));

        assert_eq!(executor.run_slot(2, &termination, &tx).unwrap(), SlotOutcome::Idle);
    }

    #[test]
    fn termination_mid_task_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RunnerRegistry::builtin().create("default").unwrap();
        let executor = executor(dir.path(), &["sleep 30"], runner);
        let (tx, _rx) = unbounded();
        let termination = executor.ctx.termination();

        let trigger = termination.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.fire();
        });
        let outcome = executor.run_slot(0, &termination, &tx).unwrap();
        timer.join().unwrap();

        assert_eq!(outcome, SlotOutcome::Requeued(0));
        assert_eq!(executor.tasks().status(0).unwrap(), TaskStatus::Pending);
        assert!(executor.tasks().completed().unwrap().is_empty());
    }

    #[test]
    fn terminated_worker_does_not_claim() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RunnerRegistry::builtin().create("default").unwrap();
        let executor = executor(dir.path(), &["true"], runner);
        let (tx, _rx) = unbounded();
        let termination = executor.ctx.termination();
        termination.fire();

        assert_eq!(executor.run_slot(0, &termination, &tx).unwrap(), SlotOutcome::Idle);
        assert_eq!(executor.tasks().remaining().unwrap(), 1);
    }

    #[test]
    fn unstartable_command_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner: Arc<dyn Runner> = Arc::new(ShellRunner::new("broken", "/nonexistent/shell"));
        let executor = executor(dir.path(), &["echo A"], runner);
        let (tx, _rx) = unbounded();

        let outcome = executor.run_slot(0, &executor.ctx.termination(), &tx).unwrap();
        assert!(matches!(outcome, SlotOutcome::Completed(RunResult { exit_code: SPAWN_FAILURE_EXIT_CODE, .. })));
        assert_eq!(executor.tasks().status(0).unwrap(), TaskStatus::Failed(SPAWN_FAILURE_EXIT_CODE));
    }

    fn wait_for(path: &Path) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !path.exists() {
            assert!(Instant::now() < deadline, "{} never appeared", path.display());
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn busy_list_delays_recording_instead_of_dropping_it() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = FarmContext::new(dir.path())
            .with_lock_area(None)
            .with_lock_wait(Duration::from_millis(200));
        let runner = RunnerRegistry::builtin().create("default").unwrap();
        let executor = Arc::new(executor_with(ctx, &["sleep 0.5"], runner));

        let worker = Arc::clone(&executor);
        let run = thread::spawn(move || {
            let (tx, _rx) = unbounded();
            worker.run_slot(0, &worker.ctx.termination(), &tx)
        });

        // Another node holds the list lock past the first recording window.
        wait_for(&dir.path().join("logs/log_0"));
        let lock = executor.ctx.lock("lock");
        let held = lock.acquire().unwrap();
        thread::sleep(Duration::from_millis(800));
        drop(held);

        let outcome = run.join().unwrap().unwrap();
        assert!(matches!(outcome, SlotOutcome::Completed(RunResult { exit_code: 0, .. })));
        assert_eq!(executor.tasks().status(0).unwrap(), TaskStatus::Done(0));
        assert_eq!(executor.tasks().remaining().unwrap(), 0);
    }

    /// Runs through `sh -c` but cannot terminate its children.
    struct Unkillable;

    impl Runner for Unkillable {
        fn name(&self) -> &str {
            "unkillable"
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
    fn lost_run_is_requeued_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), &["sleep 30"], Arc::new(Unkillable));
        let (tx, _rx) = unbounded();
        let termination = executor.ctx.termination();

        let trigger = termination.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.fire();
        });
        let outcome = executor.run_slot(0, &termination, &tx).unwrap();
        timer.join().unwrap();

        assert_eq!(outcome, SlotOutcome::Requeued(0));
        assert_eq!(executor.tasks().status(0).unwrap(), TaskStatus::Pending);
        assert!(executor.tasks().completed().unwrap().is_empty());
    }
}
