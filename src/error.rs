use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FarmError>;

#[derive(Debug, Error)]
pub enum FarmError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unable to lock {path} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unable to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FarmError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FarmError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        FarmError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, FarmError::LockTimeout { .. })
    }
}
