//! Named runner and task-list definitions read from a configuration directory.
//!
//! Every `*.toml` file in the directory may define any number of runners and
//! task-list handlers:
//!
//! ```toml
//! [runners.ubuntu]
//! kind = "container"
//! image = "docker.io/library/ubuntu:24.04"
//!
//! [tasklists.convert]
//! kind = "template"
//! command = "convert {input} out/{id}.png"
//! ```
//!
//! `kind` selects a built-in constructor from the corresponding registry; the
//! remaining keys are handed to it as [`Settings`].

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::Deserialize;

use crate::error::{FarmError, Result};

pub const CONFIG_DIR_ENV: &str = "FARMER_CONFIG_DIR";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, owner: &str, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| FarmError::Config(format!("'{}' is missing required setting '{}'", owner, key)))
    }

    /// Fails on any key outside `known`.
    pub fn reject_unknown(&self, owner: &str, known: &[&str]) -> Result<()> {
        match self.0.keys().find(|key| !known.contains(&key.as_str())) {
            Some(key) => Err(FarmError::Config(format!("'{}' has unknown setting '{}'", owner, key))),
            None => Ok(()),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub kind: String,
    pub settings: Settings,
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    kind: String,
    #[serde(flatten)]
    settings: BTreeMap<String, toml::Value>,
}

impl From<RawDefinition> for Definition {
    fn from(raw: RawDefinition) -> Self {
        let settings = raw
            .settings
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();
        Definition {
            kind: raw.kind,
            settings: Settings(settings),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    runners: BTreeMap<String, RawDefinition>,
    #[serde(default)]
    tasklists: BTreeMap<String, RawDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub runners: BTreeMap<String, Definition>,
    pub tasklists: BTreeMap<String, Definition>,
}

impl Config {
    /// `$FARMER_CONFIG_DIR`, else `$HOME/.farmer`.
    pub fn default_dir() -> Option<PathBuf> {
        env::var_os(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".farmer")))
    }

    /// Loads every `*.toml` in `dir`, in name order. A missing directory
    /// yields an empty configuration.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut config = Config::default();
        if !dir.is_dir() {
            debug!("No configuration directory at '{}'.", dir.display());
            return Ok(config);
        }

        let entries = fs::read_dir(dir).map_err(|e| FarmError::io(dir, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        for path in paths {
            config.load_file(&path)?;
        }
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| FarmError::io(path, e))?;
        let file: ConfigFile = toml::from_str(&text).map_err(|e| FarmError::parse(path, e.to_string()))?;

        for (name, def) in file.runners {
            if self.runners.insert(name.clone(), def.into()).is_some() {
                warn!("Runner '{}' redefined in '{}'.", name, path.display());
            }
        }
        for (name, def) in file.tasklists {
            if self.tasklists.insert(name.clone(), def.into()).is_some() {
                warn!("Task list handler '{}' redefined in '{}'.", name, path.display());
            }
        }
        debug!("Loaded configuration from '{}'.", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_definitions_from_all_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.toml"),
            "[runners.ubuntu]\nkind = \"container\"\nimage = \"ubuntu:24.04\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.toml"),
            "[tasklists.convert]\nkind = \"template\"\ncommand = \"convert {input}\"\nretries = 3\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "[runners.ignored]\nkind = \"x\"\n").unwrap();

        let config = Config::load_dir(dir.path()).unwrap();
        assert_eq!(config.runners.len(), 1);
        let ubuntu = &config.runners["ubuntu"];
        assert_eq!(ubuntu.kind, "container");
        assert_eq!(ubuntu.settings.get("image"), Some("ubuntu:24.04"));

        let convert = &config.tasklists["convert"];
        assert_eq!(convert.settings.get("retries"), Some("3"));
        assert!(convert.settings.reject_unknown("convert", &["command"]).is_err());
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_dir(&dir.path().join("nope")).unwrap();
        assert!(config.runners.is_empty());
        assert!(config.tasklists.is_empty());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.toml"), "[runners.x]\nimage = 1\n").unwrap();
        assert!(matches!(Config::load_dir(dir.path()), Err(FarmError::Parse { .. })));
    }
}
