use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{config::Config, manager::orchestrator::FarmOptions};

/// Runs the commands in a task list across a pool of workers, resuming
/// wherever a previous run over the same work directory stopped.
#[derive(Parser, Debug)]
#[command(name = "farmer", version, about)]
pub struct Cli {
    /// Task list to execute.
    pub tasklist: PathBuf,

    /// Number of workers.
    #[arg(short = 'n', long = "proc", default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub proc: u16,

    /// Stop the farm after this many seconds.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Directory for logs, progress and timeline [default: <tasklist>_workdir].
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Runner executing each task.
    #[arg(short, long, default_value = "default")]
    pub runner: String,

    /// Handler parsing the task list.
    #[arg(short = 't', long, default_value = "default")]
    pub tasklist_handler: String,

    /// Directory with runner and task list definitions [default: ~/.farmer].
    #[arg(long, env = "FARMER_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Requeue tasks left claimed by a farm that died without cleaning up.
    /// Only use when no other farm works on the same directory.
    #[arg(long)]
    pub recover: bool,

    /// Keep locks in memory instead of lock files. Only for a work directory
    /// no other farm uses.
    #[arg(long)]
    pub single_node: bool,

    /// Debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn options(&self) -> FarmOptions {
        let mut options = FarmOptions::new(&self.tasklist);
        if let Some(workdir) = &self.workdir {
            options.workdir = workdir.clone();
        }
        options.pool_size = self.proc as usize;
        options.timeout = self.timeout.map(Duration::from_secs);
        options.runner = self.runner.clone();
        options.tasklist_handler = self.tasklist_handler.clone();
        options.config_dir = self.config_dir.clone().or_else(Config::default_dir);
        options.recover = self.recover;
        options.single_node = self.single_node;
        options
    }
}
