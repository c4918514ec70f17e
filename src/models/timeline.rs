use serde::{Deserialize, Serialize};

use super::task::RunResult;

/// A completed task's execution window, in Chrome trace-event form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    #[serde(rename = "cat")]
    pub category: String,
    pub name: String,
    pub pid: u32,
    #[serde(rename = "tid")]
    pub worker_id: usize,
    #[serde(rename = "ts")]
    pub start_ts_us: i64,
    #[serde(rename = "dur")]
    pub duration_us: i64,
    #[serde(rename = "ph")]
    pub phase: String,
    #[serde(default)]
    pub args: EventArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventArgs {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl TimelineEvent {
    /// `pid` identifies the farm process the task ran under.
    pub fn from_result(result: &RunResult, pid: u32) -> Self {
        TimelineEvent {
            category: "task".to_string(),
            name: result.task_id.to_string(),
            pid,
            worker_id: result.worker_id,
            start_ts_us: result.start_time.timestamp_micros(),
            duration_us: result.duration_us(),
            phase: "X".to_string(),
            args: EventArgs {
                command: result.command.clone(),
                exit_code: result.exit_code,
            },
        }
    }
}
