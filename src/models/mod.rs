pub mod message;
pub mod task;
pub mod timeline;
