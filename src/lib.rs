pub mod args;
pub mod catalog;
pub mod config;
pub mod error;
pub mod log;
pub mod task;

// Execution engine
pub mod engine;
pub mod executor;
pub mod pipeline;
pub mod stream;

pub use engine::Engine;
pub use error::{Error, Result, TaskError, ValidationError};
pub use task::{Task, TaskResult};
