//! Engine facade.
//!
//! Ties a loaded [`ToolCatalog`] to the executor and pipeline coordinator.
//! Every operator input arrives as an explicit argument; the engine keeps no
//! UI state of its own.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::args::build_args;
use crate::catalog::ToolCatalog;
use crate::config::EngineConfig;
use crate::executor::ProcessExecutor;
use crate::pipeline::{PipelineCoordinator, PipelineState};
use crate::task::{Task, TaskResult};
use crate::{rlog_debug, rlog_warn, Result};

pub struct Engine {
    catalog: ToolCatalog,
    config: EngineConfig,
    executor: ProcessExecutor,
    pipeline: PipelineCoordinator,
}

impl Engine {
    pub fn new(catalog: ToolCatalog, config: EngineConfig) -> Self {
        let executor = ProcessExecutor::new(&config);
        let pipeline = PipelineCoordinator::new(executor.clone(), config.result_buffer);
        Self {
            catalog,
            config,
            executor,
            pipeline,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prepare a task for the tool behind `display_label` (`[category] name`).
    ///
    /// Nothing is started. Fails with a validation error for bad domains, a
    /// missing output directory, unbalanced quotes or a malformed label, and
    /// with [`Error::UnknownTool`](crate::Error::UnknownTool) when the catalog
    /// has no such tool.
    pub fn build_task(
        &self,
        display_label: &str,
        raw_domains: &str,
        extra_args: &str,
        output_dir: &str,
    ) -> Result<Task> {
        let entry = self.catalog.lookup(display_label)?;
        let built = build_args(raw_domains, extra_args, output_dir).inspect_err(|e| {
            rlog_warn!("build_task {}: {}", display_label, e);
        })?;
        let command = entry.resolve()?;
        rlog_debug!(
            "build_task {} -> {} ({} args)",
            display_label,
            command.program.display(),
            command.args.len() + built.args.len()
        );
        Ok(Task::new(&entry.name, &entry.category, command, built))
    }

    /// Run one task; see [`ProcessExecutor::run`].
    pub fn run(&self, task: Task, cancel: CancellationToken) -> mpsc::Receiver<TaskResult> {
        self.executor.run(task, cancel)
    }

    /// Run one task into a channel shared with other producers.
    pub fn run_into(&self, task: Task, cancel: CancellationToken, tx: mpsc::Sender<TaskResult>) {
        self.executor.run_into(task, cancel, tx)
    }

    /// A fresh bounded channel sized from the engine configuration.
    pub fn result_channel(&self) -> (mpsc::Sender<TaskResult>, mpsc::Receiver<TaskResult>) {
        mpsc::channel(self.config.result_buffer.max(1))
    }

    /// See [`PipelineCoordinator::run_pipeline`].
    pub fn run_pipeline<F>(
        &self,
        first: Task,
        build_second: F,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TaskResult>>
    where
        F: FnOnce(&TaskResult) -> Result<Task> + Send + 'static,
    {
        self.pipeline.run_pipeline(first, build_second, cancel)
    }

    /// See [`PipelineCoordinator::run_piped`].
    pub fn run_piped(&self, first: Task, cancel: CancellationToken) -> Result<mpsc::Receiver<TaskResult>> {
        self.pipeline.run_piped(first, cancel)
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn watch_pipeline(&self) -> watch::Receiver<PipelineState> {
        self.pipeline.subscribe()
    }
}
