use std::{process::Command, sync::Arc};

use crate::{config::Settings, error::Result, models::task::Task};

use super::Runner;

/// Runs the command line through `<shell> -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    name: String,
    shell: String,
}

impl ShellRunner {
    pub fn new(name: impl Into<String>, shell: impl Into<String>) -> Self {
        ShellRunner {
            name: name.into(),
            shell: shell.into(),
        }
    }

    pub fn from_settings(name: &str, settings: &Settings) -> Result<Arc<dyn Runner>> {
        settings.reject_unknown(name, &["shell"])?;
        let shell = settings.get("shell").unwrap_or("sh");
        Ok(Arc::new(ShellRunner::new(name, shell)))
    }
}

impl Runner for ShellRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, task: &Task) -> Command {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(&task.command);
        command
    }
}
