//! The shared, lockable list of tasks.
//!
//! Progress lives in the work directory so that several workers, and several
//! farm processes on a shared filesystem, can drain one list together and a
//! restarted farm resumes where the previous one stopped:
//!
//! - `cursor`: index of the next never-claimed task. Only ever increases.
//! - `requeued`: tasks returned by terminated workers, `<id> <command>` per
//!   line. These are handed out before the cursor moves on.
//! - `completed`: append-only `<id> <exit_code> <command>` log.
//!
//! Every read-modify-write of these files happens under the list lock.

pub mod list;
pub mod template;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    config::{Config, Definition, Settings},
    context::FarmContext,
    error::{FarmError, Result},
    lock::Lock,
    models::task::{Task, TaskStatus},
    persist,
};

pub use list::ListHandler;
pub use template::TemplateHandler;

/// A task-list format: turns the file given on the command line into tasks.
pub trait TaskSource: Send + Sync {
    fn name(&self) -> &str;
    fn tasks(&self, path: &Path) -> Result<Vec<Task>>;
}

pub type HandlerConstructor = fn(name: &str, settings: &Settings) -> Result<Box<dyn TaskSource>>;

/// Task-list handler kinds and named handler definitions.
pub struct HandlerRegistry {
    kinds: BTreeMap<String, HandlerConstructor>,
    named: BTreeMap<String, Definition>,
}

impl HandlerRegistry {
    /// `default` and `list` read one command per line.
    pub fn builtin() -> Self {
        let mut registry = HandlerRegistry {
            kinds: BTreeMap::new(),
            named: BTreeMap::new(),
        };
        registry.register_kind("list", ListHandler::from_settings);
        registry.register_kind("template", TemplateHandler::from_settings);
        for name in ["default", "list"] {
            registry.define(name, Definition {
                kind: "list".to_string(),
                settings: Settings::default(),
            });
        }
        registry
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        for (name, def) in &config.tasklists {
            self.define(name, def.clone());
        }
        self
    }

    pub fn register_kind(&mut self, kind: &str, constructor: HandlerConstructor) {
        self.kinds.insert(kind.to_string(), constructor);
    }

    pub fn define(&mut self, name: &str, def: Definition) {
        self.named.insert(name.to_string(), def);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn TaskSource>> {
        let def = self.named.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            FarmError::NotFound(format!("task list handler '{}' (known: {})", name, known.join(", ")))
        })?;
        let constructor = self.kinds.get(&def.kind).ok_or_else(|| {
            FarmError::NotFound(format!("task list kind '{}' (used by handler '{}')", def.kind, name))
        })?;
        constructor(name, &def.settings)
    }
}

/// Persisted progress, read fresh under the lock for every operation.
#[derive(Debug, Default)]
struct Progress {
    cursor: u64,
    requeued: BTreeSet<u64>,
    completed: BTreeMap<u64, i32>,
}

pub struct TaskList {
    tasks: Vec<Task>,
    ctx: Arc<FarmContext>,
    lock: Lock,
}

impl TaskList {
    pub fn new(tasks: Vec<Task>, ctx: Arc<FarmContext>) -> Self {
        let lock = ctx.lock("lock");
        TaskList { tasks, ctx, lock }
    }

    /// Parses `path` with the handler registered as `handler`.
    pub fn load(registry: &HandlerRegistry, handler: &str, path: &Path, ctx: Arc<FarmContext>) -> Result<Self> {
        let source = registry.create(handler)?;
        let tasks = source.tasks(path)?;
        info!(
            "Loaded {} tasks from '{}' with handler '{}'.",
            tasks.len(),
            path.display(),
            source.name()
        );
        Ok(TaskList::new(tasks, ctx))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_id: u64) -> Option<&Task> {
        self.tasks.get(task_id as usize)
    }

    /// Hands out the next task, requeued ones first. `None` once nothing is
    /// left to claim.
    pub fn claim_next(&self) -> Result<Option<Task>> {
        let _guard = self.lock.acquire()?;

        let mut requeued = self.read_requeued()?;
        if !requeued.is_empty() {
            let completed = self.read_completed()?;
            let mut claimed = None;
            while let Some(task_id) = requeued.pop_first() {
                if !completed.contains_key(&task_id) && self.get(task_id).is_some() {
                    claimed = self.get(task_id).cloned();
                    break;
                }
            }
            self.write_requeued(&requeued)?;
            if let Some(task) = claimed {
                debug!("Claimed requeued task {}.", task.id);
                return Ok(Some(task));
            }
        }

        let cursor = self.read_cursor()?;
        match self.get(cursor) {
            None => Ok(None),
            Some(task) => {
                self.write_cursor(cursor + 1)?;
                debug!("Claimed task {}.", task.id);
                Ok(Some(task.clone()))
            }
        }
    }

    /// Appends to the completion log. Recording a task twice keeps the first
    /// entry, and a completed task is dropped from the requeue set.
    pub fn record_done(&self, task_id: u64, exit_code: i32) -> Result<()> {
        let _guard = self.lock.acquire()?;

        let completed = self.read_completed()?;
        if let Some(previous) = completed.get(&task_id) {
            warn!(
                "Task {} already recorded with exit code {}, ignoring exit code {}.",
                task_id, previous, exit_code
            );
            return Ok(());
        }

        let command = self.get(task_id).map(|t| t.command.as_str()).unwrap_or("");
        persist::append_line(
            &self.ctx.completed_path(),
            &format!("{} {} {}", task_id, exit_code, command),
        )?;

        let mut requeued = self.read_requeued()?;
        if requeued.remove(&task_id) {
            self.write_requeued(&requeued)?;
        }
        Ok(())
    }

    /// Makes a claimed task claimable again. No-op for completed tasks.
    pub fn record_requeue(&self, task_id: u64) -> Result<()> {
        let _guard = self.lock.acquire()?;

        if self.read_completed()?.contains_key(&task_id) {
            debug!("Task {} already completed, not requeueing.", task_id);
            return Ok(());
        }
        let mut requeued = self.read_requeued()?;
        if requeued.insert(task_id) {
            self.write_requeued(&requeued)?;
        }
        Ok(())
    }

    /// Number of tasks a claim could still hand out.
    pub fn remaining(&self) -> Result<usize> {
        let _guard = self.lock.acquire()?;
        let progress = self.read_progress()?;
        let fresh = self.len().saturating_sub(progress.cursor as usize);
        let requeued = progress
            .requeued
            .iter()
            .filter(|id| !progress.completed.contains_key(id))
            .count();
        Ok(fresh + requeued)
    }

    pub fn status(&self, task_id: u64) -> Result<TaskStatus> {
        if self.get(task_id).is_none() {
            return Err(FarmError::NotFound(format!("task {}", task_id)));
        }
        let _guard = self.lock.acquire()?;
        let progress = self.read_progress()?;

        Ok(match progress.completed.get(&task_id) {
            Some(code) => TaskStatus::from_exit_code(*code),
            None if progress.requeued.contains(&task_id) || task_id >= progress.cursor => TaskStatus::Pending,
            None => TaskStatus::Claimed,
        })
    }

    /// Exit code of every task in the completion log.
    pub fn completed(&self) -> Result<BTreeMap<u64, i32>> {
        let _guard = self.lock.acquire()?;
        self.read_completed()
    }

    /// Requeues tasks that were claimed but neither completed nor requeued,
    /// which is what a farm killed without warning leaves behind. Only safe
    /// while no other farm is working on the same directory.
    pub fn recover_orphans(&self) -> Result<Vec<u64>> {
        let _guard = self.lock.acquire()?;
        let mut progress = self.read_progress()?;

        let claimed_end = progress.cursor.min(self.len() as u64);
        let orphans: Vec<u64> = (0..claimed_end)
            .filter(|id| !progress.completed.contains_key(id) && !progress.requeued.contains(id))
            .collect();
        if !orphans.is_empty() {
            progress.requeued.extend(orphans.iter().copied());
            self.write_requeued(&progress.requeued)?;
            info!("Recovered {} abandoned tasks.", orphans.len());
        }
        Ok(orphans)
    }

    fn read_progress(&self) -> Result<Progress> {
        Ok(Progress {
            cursor: self.read_cursor()?,
            requeued: self.read_requeued()?,
            completed: self.read_completed()?,
        })
    }

    fn read_cursor(&self) -> Result<u64> {
        let path = self.ctx.cursor_path();
        match persist::read_optional(&path)? {
            None => Ok(0),
            Some(text) => text
                .trim()
                .parse()
                .map_err(|_| FarmError::parse(&path, format!("invalid cursor '{}'", text.trim()))),
        }
    }

    fn write_cursor(&self, cursor: u64) -> Result<()> {
        persist::write_atomic(&self.ctx.cursor_path(), format!("{}\n", cursor).as_bytes())
    }

    fn read_requeued(&self) -> Result<BTreeSet<u64>> {
        let path = self.ctx.requeued_path();
        let text = persist::read_optional(&path)?.unwrap_or_default();
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_id(&path, line))
            .collect()
    }

    fn write_requeued(&self, requeued: &BTreeSet<u64>) -> Result<()> {
        let mut text = String::new();
        for task_id in requeued {
            let command = self.get(*task_id).map(|t| t.command.as_str()).unwrap_or("");
            text.push_str(&format!("{} {}\n", task_id, command));
        }
        persist::write_atomic(&self.ctx.requeued_path(), text.as_bytes())
    }

    fn read_completed(&self) -> Result<BTreeMap<u64, i32>> {
        let path = self.ctx.completed_path();
        let text = persist::read_optional(&path)?.unwrap_or_default();
        let mut completed = BTreeMap::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let task_id = parse_id(&path, line)?;
            let exit_code = line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse().ok())
                .ok_or_else(|| FarmError::parse(&path, format!("missing exit code in '{}'", line)))?;
            completed.entry(task_id).or_insert(exit_code);
        }
        Ok(completed)
    }
}

fn parse_id(path: &Path, line: &str) -> Result<u64> {
    line.split_whitespace()
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| FarmError::parse(path, format!("invalid task line '{}'", line)))
}
