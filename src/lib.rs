//! Task farming: drain a list of shell commands with a pool of workers,
//! coordinating through lock-protected files in a work directory so that
//! interrupted runs can resume and several farms can share one list.

pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod manager;
pub mod models;
pub mod persist;
pub mod runner;
pub mod tasklist;
pub mod worker;

pub use context::FarmContext;
pub use error::{FarmError, Result};
pub use manager::orchestrator::{FarmOptions, FarmOutcome, Orchestrator};
