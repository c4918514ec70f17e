use std::io::{self, Write};

use chrono::Local;
use crossterm::style::Stylize;

use crate::{manager::signals, models::task::RunResult};

/// Per-task progress lines on stdout.
#[derive(Debug, Clone, Copy)]
pub struct Console {
    enabled: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub done: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Slots lost to a worker error rather than a task result.
    pub errors: usize,
}

impl Console {
    pub fn new() -> Self {
        Console { enabled: true }
    }

    pub fn quiet() -> Self {
        Console { enabled: false }
    }

    pub fn started(&self, worker_id: usize, task_id: u64, command: &str) {
        self.line(format!(
            "{} task {} on worker {}: {}",
            "start".cyan(),
            task_id,
            worker_id,
            command
        ));
    }

    pub fn finished(&self, result: &RunResult) {
        let seconds = result.duration_us() as f64 / 1e6;
        let label = if result.exit_code == 0 {
            "done".green()
        } else {
            "fail".red()
        };
        self.line(format!(
            "{} task {} (exit {}) in {:.1}s",
            label, result.task_id, result.exit_code, seconds
        ));
    }

    pub fn requeued(&self, worker_id: usize, task_id: u64) {
        self.line(format!(
            "{} task {} returned by worker {}",
            "requeue".yellow(),
            task_id,
            worker_id
        ));
    }

    pub fn errored(&self, worker_id: usize, message: &str) {
        self.line(format!("{} worker {}: {}", "error".red().bold(), worker_id, message));
    }

    pub fn nothing_to_do(&self, total: usize) {
        self.line(format!("All {} tasks already claimed or completed.", total));
    }

    pub fn timed_out(&self) {
        self.line(format!("{} stopping the farm", "timeout".red().bold()));
    }

    pub fn signalled(&self, signo: i32) {
        self.line(format!(
            "{} received {}, stopping the farm",
            "signal".red().bold(),
            signals::name(signo)
        ));
    }

    pub fn killing(&self, signo: i32) {
        self.line(format!(
            "{} received {} again, killing running tasks",
            "signal".red().bold(),
            signals::name(signo)
        ));
    }

    pub fn summary(&self, summary: &Summary) {
        let mut line = format!(
            "{} {} done, {} failed, {} requeued",
            "finished".bold(),
            summary.done,
            summary.failed,
            summary.requeued
        );
        if summary.errors > 0 {
            line.push_str(&format!(", {} worker errors", summary.errors));
        }
        self.line(line);
    }

    fn line(&self, message: String) {
        if !self.enabled {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{} {}", Local::now().format("%H:%M:%S").to_string().dim(), message);
        let _ = stdout.flush();
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::new()
    }
}
