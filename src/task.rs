//! Task data model.
//!
//! A [`Task`] is one prepared invocation of a catalog tool. It is moved into
//! the executor for its run, so it can never be driven by two executors at
//! once, and observers only ever see it through [`TaskResult`] snapshots.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::path::PathBuf;
use uuid::Uuid;

use crate::args::{BuiltArgs, DOMAIN_FLAG};
use crate::catalog::ResolvedCommand;
use crate::error::TaskError;
use crate::rlog_warn;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a task sits relative to a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// A standalone run.
    #[default]
    Single,
    /// Upstream stage of a pipeline.
    First,
    /// Downstream stage of a pipeline.
    Second,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    /// Built, not yet handed to an executor.
    #[default]
    Prepared,
    Running,
    /// Terminal: output and error are fixed.
    Finished,
}

/// One prepared, possibly running, invocation of an external tool.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Tool display name, without the category prefix.
    pub name: String,
    pub category: String,
    /// Resolved executable.
    pub command: PathBuf,
    /// Fixed arguments from the catalog template, placed before `args`.
    pub command_args: Vec<String>,
    /// Builder output: `--domain` pairs, then free-form tokens.
    pub args: Vec<String>,
    pub domains: Vec<String>,
    /// Working directory of the child process.
    pub output_dir: PathBuf,
    pub piping: bool,
    pub stage: Stage,
    /// Downstream template for pipe mode.
    pub pipe_target: Option<Box<Task>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    status: TaskStatus,
    output: Vec<u8>,
    error: Option<TaskError>,
}

impl Task {
    /// Create a task with an empty output buffer and no error.
    pub fn new(name: &str, category: &str, command: ResolvedCommand, built: BuiltArgs) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            category: category.to_string(),
            command: command.program,
            command_args: command.args,
            args: built.args,
            domains: built.domains,
            output_dir: built.output_dir,
            piping: false,
            stage: Stage::Single,
            pipe_target: None,
            started_at: None,
            finished_at: None,
            status: TaskStatus::Prepared,
            output: Vec::new(),
            error: None,
        }
    }

    pub fn with_pipe_target(mut self, next: Task) -> Self {
        self.piping = true;
        self.pipe_target = Some(Box::new(next));
        self
    }

    /// A fresh copy of this task aimed at different domains.
    ///
    /// The free-form arguments that followed the old `--domain` pairs are kept.
    pub fn retarget(&self, domains: Vec<String>) -> Task {
        let skip = (self.domains.len() * 2).min(self.args.len());
        let mut args = Vec::with_capacity(domains.len() * 2 + self.args.len() - skip);
        for domain in &domains {
            args.push(DOMAIN_FLAG.to_string());
            args.push(domain.clone());
        }
        args.extend_from_slice(&self.args[skip..]);

        Task {
            id: TaskId::new(),
            args,
            domains,
            pipe_target: None,
            started_at: None,
            finished_at: None,
            status: TaskStatus::Prepared,
            output: Vec::new(),
            error: None,
            ..self.clone()
        }
    }

    /// Wall time from `begin` to `finish`, once both have happened.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.status == TaskStatus::Finished
    }

    pub fn succeeded(&self) -> bool {
        self.is_finished() && self.error.is_none()
    }

    /// Full argument list passed to the executable.
    pub fn argv(&self) -> impl Iterator<Item = &String> {
        self.command_args.iter().chain(self.args.iter())
    }

    /// Command line for logs and display.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.display().to_string())
            .chain(self.argv().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Mark the task as running.
    ///
    /// # Panics
    ///
    /// A task runs exactly once; starting it again is a bug in the caller.
    pub fn begin(&mut self) {
        assert_eq!(
            self.status,
            TaskStatus::Prepared,
            "task {} ({}) was already started",
            self.name,
            self.id.short()
        );
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record the terminal error. The first error wins.
    pub fn fail(&mut self, error: TaskError) {
        if self.is_finished() {
            rlog_warn!("task {} is finished; ignoring error: {}", self.name, error);
            return;
        }
        match &self.error {
            Some(existing) => {
                rlog_warn!(
                    "task {} already failed ({}); ignoring: {}",
                    self.name,
                    existing,
                    error
                );
            }
            None => self.error = Some(error),
        }
    }

    /// Install the streamed output and enter the terminal state.
    pub fn finish(&mut self, output: Vec<u8>) {
        if self.is_finished() {
            rlog_warn!("task {} finished twice", self.name);
            return;
        }
        self.output = output;
        self.status = TaskStatus::Finished;
        self.finished_at = Some(Utc::now());
    }

    pub fn header(&self) -> TaskHeader {
        TaskHeader {
            task_id: self.id,
            task_name: self.name.clone(),
            category: self.category.clone(),
            stage: self.stage,
        }
    }

    /// The authoritative snapshot of a finished task.
    pub fn final_result(&self) -> TaskResult {
        self.header()
            .snapshot(self.output.clone(), self.error.clone(), true)
    }
}

/// Identity stamped on every snapshot of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHeader {
    pub task_id: TaskId,
    pub task_name: String,
    pub category: String,
    pub stage: Stage,
}

impl TaskHeader {
    pub fn snapshot(&self, output: Vec<u8>, error: Option<TaskError>, is_final: bool) -> TaskResult {
        TaskResult {
            task_id: self.task_id,
            task_name: self.task_name.clone(),
            category: self.category.clone(),
            stage: self.stage,
            output,
            error,
            is_final,
        }
    }
}

/// Immutable snapshot of a task's output and error state.
///
/// Snapshots for one task arrive in order of growing output; a later one
/// supersedes an earlier one. The snapshot with `is_final` set comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_name: String,
    pub category: String,
    pub stage: Stage,
    /// Everything the process has written so far.
    pub output: Vec<u8>,
    pub error: Option<TaskError>,
    pub is_final: bool,
}

impl TaskResult {
    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }

    pub fn succeeded(&self) -> bool {
        self.is_final && self.error.is_none()
    }
}
