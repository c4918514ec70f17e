//! Top-level farm run.

use std::{path::PathBuf, process, sync::Arc, time::Duration};

use crossbeam_channel::{after, never, select};
use log::{error, info, warn};

use crate::{
    app::console::{Console, Summary},
    config::Config,
    context::FarmContext,
    error::{FarmError, Result},
    models::{message::WorkerEvent, timeline::TimelineEvent},
    runner::RunnerRegistry,
    tasklist::{HandlerRegistry, TaskList},
    worker::{executor::Executor, pool::WorkerPool},
};

use super::{signals, timeline::TimelineRecorder};

pub const TIMEOUT_EXIT_CODE: i32 = 124;

const TEARDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct FarmOptions {
    pub tasklist: PathBuf,
    pub workdir: PathBuf,
    pub pool_size: usize,
    pub timeout: Option<Duration>,
    pub runner: String,
    pub tasklist_handler: String,
    pub config_dir: Option<PathBuf>,
    pub recover: bool,
    /// Process-local locks; see [`FarmContext::with_memory_locks`].
    pub single_node: bool,
}

impl FarmOptions {
    pub fn new(tasklist: impl Into<PathBuf>) -> Self {
        let tasklist = tasklist.into();
        let mut workdir = tasklist.clone().into_os_string();
        workdir.push("_workdir");
        FarmOptions {
            tasklist,
            workdir: PathBuf::from(workdir),
            pool_size: 8,
            timeout: None,
            runner: "default".to_string(),
            tasklist_handler: "default".to_string(),
            config_dir: None,
            recover: false,
            single_node: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmOutcome {
    Completed(Summary),
    /// The pool drained, but some slots ended in a worker error instead of a
    /// task result.
    Failed(Summary),
    TimedOut(Summary),
    Signalled(i32, Summary),
}

impl FarmOutcome {
    /// Task failures do not fail the farm; worker errors and early stops do.
    pub fn exit_code(&self) -> i32 {
        match self {
            FarmOutcome::Completed(_) => 0,
            FarmOutcome::Failed(_) => 1,
            FarmOutcome::TimedOut(_) => TIMEOUT_EXIT_CODE,
            FarmOutcome::Signalled(signo, _) => 128 + signo,
        }
    }

    pub fn summary(&self) -> &Summary {
        match self {
            FarmOutcome::Completed(summary)
            | FarmOutcome::Failed(summary)
            | FarmOutcome::TimedOut(summary)
            | FarmOutcome::Signalled(_, summary) => summary,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Stop {
    Drained,
    TimedOut,
    Signalled(i32),
}

enum Wake {
    Event(Option<WorkerEvent>),
    Signal(Option<i32>),
    Deadline,
}

pub struct Orchestrator {
    options: FarmOptions,
    ctx: Arc<FarmContext>,
    console: Console,
}

impl Orchestrator {
    pub fn new(options: FarmOptions, console: Console) -> Self {
        let ctx = Arc::new(FarmContext::new(&options.workdir).with_memory_locks(options.single_node));
        Orchestrator { options, ctx, console }
    }

    pub fn with_context(options: FarmOptions, ctx: FarmContext, console: Console) -> Self {
        Orchestrator {
            options,
            ctx: Arc::new(ctx),
            console,
        }
    }

    pub fn run(&self) -> Result<FarmOutcome> {
        self.ctx.prepare_dirs()?;

        let config = match &self.options.config_dir {
            Some(dir) => Config::load_dir(dir)?,
            None => Config::default(),
        };
        let handlers = HandlerRegistry::builtin().with_config(&config);
        let runners = RunnerRegistry::builtin().with_config(&config);

        let tasks = Arc::new(TaskList::load(
            &handlers,
            &self.options.tasklist_handler,
            &self.options.tasklist,
            Arc::clone(&self.ctx),
        )?);
        let runner = runners.create(&self.options.runner)?;
        if tasks.is_empty() {
            warn!("Task list '{}' has no tasks.", self.options.tasklist.display());
        }

        if self.options.recover {
            let recovered = tasks.recover_orphans()?;
            if !recovered.is_empty() {
                warn!("Requeued abandoned tasks {:?}.", recovered);
            }
        }

        let n_slots = tasks.remaining()?;
        if n_slots == 0 {
            self.console.nothing_to_do(tasks.len());
            return Ok(FarmOutcome::Completed(Summary::default()));
        }

        let mut interrupts = signals::listen().map_err(FarmError::Signal)?;
        let deadline = match self.options.timeout {
            Some(timeout) => after(timeout),
            None => never(),
        };

        let timeline = TimelineRecorder::new(&self.ctx);
        let executor = Arc::new(Executor::new(Arc::clone(&self.ctx), Arc::clone(&tasks), runner));
        let mut pool = WorkerPool::start(Arc::clone(&self.ctx), self.options.pool_size, n_slots, executor);
        info!(
            "Farming {} of {} tasks from '{}' with {} workers.",
            n_slots,
            tasks.len(),
            self.options.tasklist.display(),
            self.options.pool_size
        );

        let events = pool.events().clone();
        let mut summary = Summary::default();
        let stop = loop {
            if pool.is_drained() {
                break Stop::Drained;
            }
            let wake = select! {
                recv(events) -> event => Wake::Event(event.ok()),
                recv(interrupts) -> signo => Wake::Signal(signo.ok()),
                recv(deadline) -> _ => Wake::Deadline,
            };
            match wake {
                Wake::Event(Some(event)) => {
                    pool.account(&event);
                    self.report(event, &timeline, &mut summary);
                }
                Wake::Event(None) => {
                    error!("Worker event channel closed early.");
                    break Stop::Drained;
                }
                Wake::Signal(Some(signo)) => {
                    self.console.signalled(signo);
                    break Stop::Signalled(signo);
                }
                Wake::Signal(None) => interrupts = never(),
                Wake::Deadline => {
                    self.console.timed_out();
                    break Stop::TimedOut;
                }
            }
        };

        if stop != Stop::Drained {
            pool.terminate();
            // Another signal while tasks wind down skips the rest of their grace.
            while !pool.workers_exited() {
                let signal = select! {
                    recv(interrupts) -> signo => Some(signo.ok()),
                    default(TEARDOWN_POLL) => None,
                };
                match signal {
                    Some(Some(signo)) => {
                        self.console.killing(signo);
                        self.ctx.request_kill();
                    }
                    Some(None) => interrupts = never(),
                    None => {}
                }
            }
        }
        pool.join();

        // Work that finished or was requeued while the pool wound down.
        let late: Vec<WorkerEvent> = pool.events().try_iter().collect();
        for event in late {
            self.report(event, &timeline, &mut summary);
        }
        self.console.summary(&summary);

        Ok(match stop {
            Stop::Drained if summary.errors > 0 => FarmOutcome::Failed(summary),
            Stop::Drained => FarmOutcome::Completed(summary),
            Stop::TimedOut => FarmOutcome::TimedOut(summary),
            Stop::Signalled(signo) => FarmOutcome::Signalled(signo, summary),
        })
    }

    fn report(&self, event: WorkerEvent, timeline: &TimelineRecorder, summary: &mut Summary) {
        match event {
            WorkerEvent::Started {
                worker_id,
                task_id,
                command,
            } => self.console.started(worker_id, task_id, &command),
            WorkerEvent::Finished {
                result: Some(result), ..
            } => {
                self.console.finished(&result);
                if result.exit_code == 0 {
                    summary.done += 1;
                } else {
                    summary.failed += 1;
                }
                if let Err(e) = timeline.append(TimelineEvent::from_result(&result, process::id())) {
                    error!("Failed to record task {} in the timeline: {}", result.task_id, e);
                }
            }
            WorkerEvent::Terminated {
                worker_id,
                task_id: Some(task_id),
                ..
            } => {
                self.console.requeued(worker_id, task_id);
                summary.requeued += 1;
            }
            WorkerEvent::Errored { worker_id, message } => {
                self.console.errored(worker_id, &message);
                summary.errors += 1;
            }
            WorkerEvent::Finished { result: None, .. } | WorkerEvent::Terminated { task_id: None, .. } => {}
        }
    }
}
