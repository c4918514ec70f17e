use std::{env, path::PathBuf, process::Command, sync::Arc};

use crate::{config::Settings, error::Result, models::task::Task};

use super::Runner;

/// Runs each task inside a fresh container. The current directory is
/// mounted at the same path and used as the container's working directory,
/// so relative paths in commands keep working.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    name: String,
    engine: String,
    image: String,
    shell: String,
    volumes: Vec<String>,
    cwd: PathBuf,
}

impl ContainerRunner {
    pub fn new(name: impl Into<String>, engine: impl Into<String>, image: impl Into<String>) -> Self {
        ContainerRunner {
            name: name.into(),
            engine: engine.into(),
            image: image.into(),
            shell: "sh".to_string(),
            volumes: Vec::new(),
            cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }

    pub fn from_settings(name: &str, settings: &Settings) -> Result<Arc<dyn Runner>> {
        Ok(Arc::new(ContainerRunner::parse(name, settings)?))
    }

    /// Settings: `image` (required), `engine` (default `podman`), `shell`,
    /// `volumes` (comma separated `host:container` mounts).
    fn parse(name: &str, settings: &Settings) -> Result<Self> {
        settings.reject_unknown(name, &["image", "engine", "shell", "volumes"])?;
        let image = settings.require(name, "image")?;
        let mut runner = ContainerRunner::new(name, settings.get("engine").unwrap_or("podman"), image);
        if let Some(shell) = settings.get("shell") {
            runner.shell = shell.to_string();
        }
        if let Some(volumes) = settings.get("volumes") {
            runner.volumes = volumes
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(runner)
    }
}

impl Runner for ContainerRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, task: &Task) -> Command {
        let cwd = self.cwd.display().to_string();
        let mut command = Command::new(&self.engine);
        command
            .args(["run", "--rm", "--init"])
            .arg("-v")
            .arg(format!("{}:{}", cwd, cwd))
            .arg("-w")
            .arg(&cwd);
        for volume in &self.volumes {
            command.arg("-v").arg(volume);
        }
        command.arg(&self.image).arg(&self.shell).arg("-c").arg(&task.command);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_settings() {
        let mut settings = Settings::default();
        settings.insert("image", "ubuntu:24.04");
        settings.insert("engine", "docker");
        settings.insert("shell", "bash");
        settings.insert("volumes", "/data:/data, /scratch:/scratch,");

        let runner = ContainerRunner::parse("ubuntu", &settings).unwrap();
        assert_eq!(runner.name, "ubuntu");
        assert_eq!(runner.engine, "docker");
        assert_eq!(runner.image, "ubuntu:24.04");
        assert_eq!(runner.shell, "bash");
        assert_eq!(runner.volumes, vec!["/data:/data", "/scratch:/scratch"]);

        let mut minimal = Settings::default();
        minimal.insert("image", "alpine");
        let runner = ContainerRunner::parse("alpine", &minimal).unwrap();
        assert_eq!(runner.engine, "podman");
        assert_eq!(runner.shell, "sh");
        assert!(runner.volumes.is_empty());
    }

    #[test]
    fn builds_engine_invocation() {
        let mut runner = ContainerRunner::new("ubuntu", "docker", "ubuntu:24.04");
        runner.cwd = PathBuf::from("/work");
        runner.volumes = vec!["/data:/data".to_string()];
        let command = runner.command(&Task::new(2, "make all"));
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(command.get_program(), "docker");
        assert_eq!(
            args,
            vec![
                "run", "--rm", "--init", "-v", "/work:/work", "-w", "/work", "-v", "/data:/data", "ubuntu:24.04",
                "sh", "-c", "make all",
            ]
        );
    }

    #[test]
    fn image_is_required() {
        assert!(ContainerRunner::from_settings("bare", &Settings::default()).is_err());

        let mut typo = Settings::default();
        typo.insert("image", "alpine");
        typo.insert("volume", "/data:/data");
        assert!(ContainerRunner::from_settings("typo", &typo).is_err());
    }
}
