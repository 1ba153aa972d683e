//! Two-stage pipeline coordination.
//!
//! A pipeline runs a first task and, only if it succeeds, builds and runs a
//! second task from the first one's final result. Progress is tracked as an
//! explicit state machine:
//!
//! ```text
//! Idle -> FirstRunning -> FirstSucceeded -> SecondRunning -> Done
//!                      \-> FirstFailed --------------------> Done
//! ```
//!
//! At most one pipeline is active per coordinator.

use regex::Regex;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, ValidationError};
use crate::executor::ProcessExecutor;
use crate::task::{Stage, Task, TaskHeader, TaskId, TaskResult};
use crate::{rlog, rlog_debug, rlog_error, Error, Result};

static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").unwrap()
});

/// How a finished pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Both stages succeeded.
    Completed,
    /// The first stage failed or was canceled; nothing else ran.
    FirstFailed,
    /// The second task could not be built.
    BuildFailed,
    /// The second stage ran and failed or was canceled.
    SecondFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    FirstRunning,
    FirstSucceeded,
    FirstFailed,
    SecondRunning,
    Done(PipelineOutcome),
}

impl PipelineState {
    /// Whether a pipeline is between launch and `Done`.
    pub fn is_active(&self) -> bool {
        !matches!(self, PipelineState::Idle | PipelineState::Done(_))
    }

    pub fn can_transition_to(&self, next: &PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle | Done(_), FirstRunning)
                | (FirstRunning, FirstSucceeded | FirstFailed)
                | (FirstSucceeded, SecondRunning)
                | (FirstSucceeded, Done(PipelineOutcome::BuildFailed))
                | (FirstFailed, Done(PipelineOutcome::FirstFailed))
                | (
                    SecondRunning,
                    Done(PipelineOutcome::Completed | PipelineOutcome::SecondFailed)
                )
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::FirstRunning => write!(f, "first running"),
            PipelineState::FirstSucceeded => write!(f, "first succeeded"),
            PipelineState::FirstFailed => write!(f, "first failed"),
            PipelineState::SecondRunning => write!(f, "second running"),
            PipelineState::Done(outcome) => write!(f, "done ({:?})", outcome),
        }
    }
}

/// Launches pipelines and tracks the active one.
#[derive(Clone)]
pub struct PipelineCoordinator {
    executor: ProcessExecutor,
    result_buffer: usize,
    state: Arc<watch::Sender<PipelineState>>,
}

impl PipelineCoordinator {
    pub fn new(executor: ProcessExecutor, result_buffer: usize) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            executor,
            result_buffer: result_buffer.max(1),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&self, next: PipelineState) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                rlog_debug!("pipeline: {} -> {}", current, next);
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });
        match rejected {
            None => Ok(()),
            Some(from) => Err(Error::InvalidPipelineTransition {
                from: from.to_string(),
                to: next.to_string(),
            }),
        }
    }

    /// Claim the coordinator for a new pipeline.
    fn begin(&self) -> Result<()> {
        let mut claimed = false;
        self.state.send_if_modified(|current| {
            if current.is_active() {
                return false;
            }
            *current = PipelineState::FirstRunning;
            claimed = true;
            true
        });
        if claimed {
            Ok(())
        } else {
            Err(Error::PipelineActive)
        }
    }

    /// Run `first`, then the task returned by `build_second`.
    ///
    /// `build_second` receives the first task's final snapshot and is only
    /// called when that task succeeded. Both stages publish into the returned
    /// channel, which closes when the pipeline is done. Returns
    /// [`Error::PipelineActive`] if a pipeline is already running.
    pub fn run_pipeline<F>(
        &self,
        first: Task,
        build_second: F,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TaskResult>>
    where
        F: FnOnce(&TaskResult) -> Result<Task> + Send + 'static,
    {
        self.begin()?;
        let (tx, rx) = mpsc::channel(self.result_buffer);
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drive(first, build_second, cancel, tx).await;
        });
        Ok(rx)
    }

    /// Run a task that carries its own downstream template.
    ///
    /// The template is re-aimed at the hosts found in the first stage's output,
    /// or keeps its own domains when none are found.
    pub fn run_piped(
        &self,
        mut first: Task,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TaskResult>> {
        let template = first
            .pipe_target
            .take()
            .ok_or_else(|| ValidationError::MissingPipeTarget(first.name.clone()))?;
        first.piping = true;
        self.run_pipeline(first, move |result| Ok(retarget_from(&template, result)), cancel)
    }

    async fn drive<F>(
        &self,
        mut first: Task,
        build_second: F,
        cancel: CancellationToken,
        tx: mpsc::Sender<TaskResult>,
    ) -> PipelineState
    where
        F: FnOnce(&TaskResult) -> Result<Task>,
    {
        let mut settle = SettleOnDrop {
            coordinator: self,
            armed: true,
        };
        first.piping = true;
        first.stage = Stage::First;
        rlog!("pipeline: starting first stage {}", first.name);
        let first = self.executor.execute(first, cancel.clone(), tx.clone()).await;

        if !first.succeeded() {
            rlog!(
                "pipeline: first stage {} failed, not launching second",
                first.name
            );
            settle.armed = false;
            self.advance(PipelineState::FirstFailed);
            return self.advance(PipelineState::Done(PipelineOutcome::FirstFailed));
        }
        self.advance(PipelineState::FirstSucceeded);

        let first_result = first.final_result();
        let built = panic::catch_unwind(AssertUnwindSafe(|| build_second(&first_result)))
            .unwrap_or_else(|payload| Err(Error::BuildPanicked(panic_message(&*payload))));
        let mut second = match built {
            Ok(task) => task,
            Err(e) => {
                rlog_error!("pipeline: building second stage failed: {}", e);
                settle.armed = false;
                let header = TaskHeader {
                    task_id: TaskId::new(),
                    task_name: format!("{} | next", first.name),
                    category: first.category.clone(),
                    stage: Stage::Second,
                };
                let snapshot =
                    header.snapshot(Vec::new(), Some(TaskError::Build(e.to_string())), true);
                if tx.send(snapshot).await.is_err() {
                    rlog_debug!("pipeline: no receiver for {} build failure", header.task_name);
                }
                return self.advance(PipelineState::Done(PipelineOutcome::BuildFailed));
            }
        };

        second.stage = Stage::Second;
        self.advance(PipelineState::SecondRunning);
        rlog!("pipeline: starting second stage {}", second.name);
        // Keep `tx` alive until the state is Done, so a closed channel means the
        // pipeline has settled.
        let second = self.executor.execute(second, cancel, tx.clone()).await;

        let outcome = if second.succeeded() {
            PipelineOutcome::Completed
        } else {
            PipelineOutcome::SecondFailed
        };
        settle.armed = false;
        self.advance(PipelineState::Done(outcome))
    }

    /// Walk an interrupted pipeline to `Done` along legal edges.
    fn abandon(&self) {
        let state = self.state();
        rlog_error!("pipeline: driver stopped in state {}", state);
        match state {
            PipelineState::FirstRunning => {
                self.advance(PipelineState::FirstFailed);
                self.advance(PipelineState::Done(PipelineOutcome::FirstFailed));
            }
            PipelineState::FirstFailed => {
                self.advance(PipelineState::Done(PipelineOutcome::FirstFailed));
            }
            PipelineState::FirstSucceeded => {
                self.advance(PipelineState::Done(PipelineOutcome::BuildFailed));
            }
            PipelineState::SecondRunning => {
                self.advance(PipelineState::Done(PipelineOutcome::SecondFailed));
            }
            PipelineState::Idle | PipelineState::Done(_) => {}
        }
    }

    fn advance(&self, next: PipelineState) -> PipelineState {
        if let Err(e) = self.transition(next) {
            rlog_error!("pipeline: {}", e);
        }
        self.state()
    }
}

/// Settles the coordinator if the driver unwinds before reaching `Done`.
struct SettleOnDrop<'a> {
    coordinator: &'a PipelineCoordinator,
    armed: bool,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Build the downstream task from a template and the upstream result.
pub fn retarget_from(template: &Task, upstream: &TaskResult) -> Task {
    let hosts = hosts_from_output(&upstream.output);
    if hosts.is_empty() {
        rlog_debug!(
            "pipeline: no hosts in {} output, keeping template domains",
            upstream.task_name
        );
        template.retarget(template.domains.clone())
    } else {
        rlog_debug!("pipeline: {} hosts from {}", hosts.len(), upstream.task_name);
        template.retarget(hosts)
    }
}

/// Hostnames found in tool output, one candidate per line.
///
/// The first word of each line is taken, URL scheme, path, port and a leading
/// `*.` are stripped, and what remains must look like a DNS name. Duplicates
/// are dropped; first-seen order is kept.
pub fn hosts_from_output(output: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(output);
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();

    for line in text.lines() {
        let Some(word) = line.split_whitespace().next() else {
            continue;
        };
        let word = word
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(word);
        let host = word.split(['/', '?', '#']).next().unwrap_or(word);
        let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
        let host = host.split(':').next().unwrap_or(host);
        let host = host.trim_start_matches("*.").trim_end_matches('.');
        let host = host.to_ascii_lowercase();

        if HOST_RE.is_match(&host) && seen.insert(host.clone()) {
            hosts.push(host);
        }
    }
    hosts
}
