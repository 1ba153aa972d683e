use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("A pipeline is already running")]
    PipelineActive,

    #[error("Invalid pipeline transition from {from} to {to}")]
    InvalidPipelineTransition { from: String, to: String },

    #[error("No home directory")]
    NoHomeDir,

    #[error("second stage builder panicked: {0}")]
    BuildPanicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rejected user input. No process is started when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("target domain cannot be empty")]
    EmptyDomains,

    #[error("target domain #{position} is empty")]
    EmptyDomainEntry { position: usize },

    #[error("output directory cannot be empty")]
    EmptyOutputDir,

    #[error("output directory does not exist: {0}")]
    OutputDirMissing(String),

    #[error("unbalanced quote in: {0}")]
    UnbalancedQuote(String),

    #[error("malformed tool label: {0}")]
    MalformedLabel(String),

    #[error("command template for '{0}' is empty")]
    EmptyCommand(String),

    #[error("task '{0}' has no downstream task to pipe into")]
    MissingPipeTarget(String),
}

/// Terminal error of a task run, carried by every snapshot after it is set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("command failed: {}", exit_label(.code))]
    CommandFailed { code: Option<i32> },

    #[error("error reading output: {0}")]
    Stream(String),

    #[error("canceled")]
    Canceled,

    #[error("could not build next stage: {0}")]
    Build(String),
}

impl TaskError {
    /// User-initiated stops are not failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}
