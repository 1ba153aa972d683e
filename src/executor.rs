//! Process executor.
//!
//! Runs exactly one external process for one [`Task`]: spawn, supervise,
//! cancel, reap. Output is handed to an [`OutputStreamer`] running as its own
//! tokio task; the executor publishes the single final snapshot once both the
//! child and the streamer are done.

use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};

use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::stream::{OutputStreamer, StreamOutcome};
use crate::task::{Task, TaskResult};
use crate::{rlog, rlog_debug, rlog_error, rlog_warn};

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessEnd {
    Exited(ExitStatus),
    Canceled,
}

/// Spawns and supervises tool processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    streamer: OutputStreamer,
    result_buffer: usize,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl ProcessExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            streamer: OutputStreamer::new(config.chunk_size, config.drain_grace),
            result_buffer: config.result_buffer.max(1),
        }
    }

    /// Run `task` in the background and return its result channel.
    ///
    /// The channel yields partial snapshots while the process runs and exactly
    /// one final snapshot, then closes. Must be called inside a tokio runtime.
    pub fn run(&self, task: Task, cancel: CancellationToken) -> mpsc::Receiver<TaskResult> {
        let (tx, rx) = mpsc::channel(self.result_buffer);
        self.run_into(task, cancel, tx);
        rx
    }

    /// Like [`run`](Self::run), publishing into a channel shared with other
    /// tasks.
    pub fn run_into(&self, task: Task, cancel: CancellationToken, tx: mpsc::Sender<TaskResult>) {
        let executor = self.clone();
        tokio::spawn(async move {
            executor.execute(task, cancel, tx).await;
        });
    }

    /// Run `task` to its terminal state and return it.
    ///
    /// Errors never escape: spawn failures, non-zero exits, read failures and
    /// cancellation all end up as the task's [`TaskError`]. When several apply
    /// the order is cancellation, then read failure, then exit status.
    pub async fn execute(
        &self,
        mut task: Task,
        cancel: CancellationToken,
        tx: mpsc::Sender<TaskResult>,
    ) -> Task {
        task.begin();
        let label = format!("{}[{}]", task.name, task.id.short());

        if cancel.is_cancelled() {
            rlog_debug!("{}: canceled before spawn", label);
            task.fail(TaskError::Canceled);
            return publish_final(task, &tx).await;
        }

        rlog!("{}: starting {}", label, task.command_line());
        let (mut child, source) = match spawn_combined(&task) {
            Ok(spawned) => spawned,
            Err(e) => {
                rlog_error!("{}: spawn failed: {}", label, e);
                task.fail(TaskError::Spawn {
                    command: task.command.display().to_string(),
                    reason: e.to_string(),
                });
                return publish_final(task, &tx).await;
            }
        };
        rlog_debug!("{}: pid {:?}", label, child.id());

        let exited = CancellationToken::new();
        let streaming = {
            let streamer = self.streamer.clone();
            let header = task.header();
            let tx = tx.clone();
            let exited = exited.clone();
            tokio::spawn(async move { streamer.stream(source, header, tx, exited).await })
        };

        let end = tokio::select! {
            status = child.wait() => status.map(ProcessEnd::Exited),
            _ = cancel.cancelled() => {
                rlog!("{}: cancel requested, killing", label);
                // kill() sends SIGKILL and reaps the child.
                child.kill().await.map(|_| ProcessEnd::Canceled)
            }
        };
        exited.cancel();

        let outcome = match streaming.await {
            Ok(outcome) => outcome,
            Err(e) => {
                rlog_error!("{}: streaming task failed: {}", label, e);
                StreamOutcome {
                    error: Some(TaskError::Stream(e.to_string())),
                    ..StreamOutcome::default()
                }
            }
        };
        if outcome.abandoned {
            rlog_warn!("{}: output pipe outlived the process", label);
        }

        match end {
            Ok(ProcessEnd::Canceled) => task.fail(TaskError::Canceled),
            Ok(ProcessEnd::Exited(status)) => {
                if let Some(error) = outcome.error.clone() {
                    task.fail(error);
                }
                if !status.success() {
                    task.fail(TaskError::CommandFailed {
                        code: status.code(),
                    });
                }
            }
            Err(e) => {
                // wait() itself failed; the child may not have been reaped.
                rlog_error!("{}: wait failed: {}", label, e);
                if let Some(error) = outcome.error.clone() {
                    task.fail(error);
                }
                task.fail(TaskError::Stream(format!("waiting for process: {}", e)));
            }
        }
        task.finish(outcome.output);

        let elapsed_ms = task.elapsed().map_or(0, |d| d.num_milliseconds());
        match task.error() {
            None => rlog!(
                "{}: finished in {}ms ({} bytes)",
                label,
                elapsed_ms,
                task.output().len()
            ),
            Some(e) if e.is_cancellation() => rlog!("{}: canceled", label),
            Some(e) => rlog_warn!("{}: {} after {}ms", label, e, elapsed_ms),
        }
        publish_final(task, &tx).await
    }
}

/// Spawn the task's process with stdout and stderr sharing one pipe.
///
/// The `Command` is dropped on return, closing the parent's copies of the
/// write end, so the reader sees end of stream once the child side closes.
fn spawn_combined(task: &Task) -> io::Result<(Child, pipe::Receiver)> {
    let (reader, writer) = std::io::pipe()?;
    let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;

    let mut command = Command::new(&task.command);
    command
        .args(task.argv())
        .current_dir(&task.output_dir)
        .stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer)
        .kill_on_drop(true);
    let child = command.spawn()?;
    Ok((child, output))
}

async fn publish_final(mut task: Task, tx: &mpsc::Sender<TaskResult>) -> Task {
    if !task.is_finished() {
        task.finish(Vec::new());
    }
    if tx.send(task.final_result()).await.is_err() {
        rlog_debug!("{}: no receiver for final result", task.name);
    }
    task
}
