pub mod orchestrator;
pub mod signals;
pub mod timeline;
