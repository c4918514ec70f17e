use std::{fs, io, path::Path};

use crate::{
    config::Settings,
    error::{FarmError, Result},
    models::task::Task,
};

use super::TaskSource;

/// One command per line. Blank lines and `#` comments are not tasks and do
/// not consume an id.
#[derive(Debug, Clone)]
pub struct ListHandler {
    name: String,
}

impl ListHandler {
    pub fn new(name: impl Into<String>) -> Self {
        ListHandler { name: name.into() }
    }

    pub fn from_settings(name: &str, settings: &Settings) -> Result<Box<dyn TaskSource>> {
        settings.reject_unknown(name, &[])?;
        Ok(Box::new(ListHandler::new(name)))
    }
}

impl TaskSource for ListHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self, path: &Path) -> Result<Vec<Task>> {
        let tasks = read_entries(path)?
            .into_iter()
            .enumerate()
            .map(|(id, line)| Task::new(id as u64, line))
            .collect();
        Ok(tasks)
    }
}

/// Trimmed, non-blank, non-comment lines of a task-list file.
pub fn read_entries(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FarmError::NotFound(format!("task list '{}'", path.display())),
        _ => FarmError::io(path, e),
    })?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
