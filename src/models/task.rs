use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Claimed,
    Done(i32),
    Failed(i32),
}

impl Task {
    pub fn new(id: u64, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
        }
    }
}

impl TaskStatus {
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            TaskStatus::Done(exit_code)
        } else {
            TaskStatus::Failed(exit_code)
        }
    }
}

/// One completed execution of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub task_id: u64,
    pub command: String,
    pub worker_id: usize,
    /// Process id of the task's child process.
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: i32,
}

impl RunResult {
    pub fn duration_us(&self) -> i64 {
        (self.end_time - self.start_time).num_microseconds().unwrap_or(i64::MAX)
    }
}
