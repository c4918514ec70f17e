use std::path::Path;

use crate::{
    config::Settings,
    error::{FarmError, Result},
    models::task::Task,
};

use super::{list::read_entries, TaskSource};

/// Each line of the task-list file is an input (typically a file path); the
/// command is built by substituting it into a template. `{input}` expands to
/// the line, `{id}` to the task id, which keeps output names unique.
#[derive(Debug, Clone)]
pub struct TemplateHandler {
    name: String,
    template: String,
}

impl TemplateHandler {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        TemplateHandler {
            name: name.into(),
            template: template.into(),
        }
    }

    pub fn from_settings(name: &str, settings: &Settings) -> Result<Box<dyn TaskSource>> {
        settings.reject_unknown(name, &["command"])?;
        let template = settings.require(name, "command")?;
        if !template.contains("{input}") {
            return Err(FarmError::Config(format!(
                "'{}' command template does not reference {{input}}",
                name
            )));
        }
        Ok(Box::new(TemplateHandler::new(name, template)))
    }

    pub fn expand(&self, id: u64, input: &str) -> String {
        self.template.replace("{input}", input).replace("{id}", &id.to_string())
    }
}

impl TaskSource for TemplateHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self, path: &Path) -> Result<Vec<Task>> {
        let tasks = read_entries(path)?
            .iter()
            .enumerate()
            .map(|(id, input)| Task::new(id as u64, self.expand(id as u64, input)))
            .collect();
        Ok(tasks)
    }
}
