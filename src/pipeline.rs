//! Execution pipeline for one preview run.
//!
//! Takes a booted instance from "files ready" to "server reachable":
//! terminate stale processes, mount, install dependencies, start the dev
//! server and wait until it is routable. Every wait races the run's
//! cancellation token and a hard timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{PipelineConfig, MAX_STEP_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::materialize::MaterializedFileSet;
use crate::sandbox::{SandboxInstance, SandboxProcess, ServerReady};

/// Stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Mounting,
    Installing,
    Starting,
    Ready,
    Failed,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Mounting => "mounting",
            PipelineStage::Installing => "installing",
            PipelineStage::Starting => "starting",
            PipelineStage::Ready => "ready",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Immutable input of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Generation of the submission that produced this request.
    pub generation: u64,
    /// Files to mount.
    pub files: Arc<MaterializedFileSet>,
    /// Tear down the existing instance before running.
    pub reset: bool,
}

impl RunRequest {
    /// Creates a run request.
    pub fn new(generation: u64, files: MaterializedFileSet, reset: bool) -> Self {
        Self {
            generation,
            files: Arc::new(files),
            reset,
        }
    }
}

/// Last lines of process output, kept for failure reasons.
struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Drives mount → install → start on a sandbox instance.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPipeline {
    config: PipelineConfig,
}

impl ExecutionPipeline {
    /// Creates a pipeline with the given commands and timeouts.
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Returns the pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the pipeline and resolves to the preview address.
    pub async fn run<I: SandboxInstance + ?Sized>(
        &self,
        instance: &I,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "pipeline",
            %run_id,
            generation = request.generation,
            instance = %instance.id()
        );

        let result = self
            .run_stages(instance, request, cancel, &run_id)
            .instrument(span)
            .await;
        match &result {
            Ok(url) => tracing::info!(
                %run_id,
                generation = request.generation,
                stage = %PipelineStage::Ready,
                url = %url,
                "preview ready"
            ),
            Err(Error::Cancelled) => tracing::debug!(
                %run_id,
                generation = request.generation,
                "run superseded"
            ),
            Err(e) => tracing::warn!(
                %run_id,
                generation = request.generation,
                stage = %PipelineStage::Failed,
                error = %e,
                diagnostics = e.diagnostics().unwrap_or(""),
                "preview run failed"
            ),
        }
        result
    }

    async fn run_stages<I: SandboxInstance + ?Sized>(
        &self,
        instance: &I,
        request: &RunRequest,
        cancel: &CancellationToken,
        run_id: &uuid::Uuid,
    ) -> Result<String> {
        if let Err(e) = instance.kill_processes().await {
            tracing::debug!(%run_id, error = %e, "ignoring stale process cleanup failure");
        }
        check_cancelled(cancel)?;

        tracing::info!(%run_id, stage = %PipelineStage::Mounting, files = request.files.len(), "mounting project");
        instance
            .mount(&request.files)
            .await
            .map_err(|e| Error::Sandbox(format!("mount failed: {}", e)))?;
        check_cancelled(cancel)?;

        tracing::info!(%run_id, stage = %PipelineStage::Installing, command = %self.config.install_command, "installing dependencies");
        self.install(instance, cancel).await?;

        tracing::info!(%run_id, stage = %PipelineStage::Starting, command = %self.config.start_command, "starting dev server");
        self.start(instance, cancel).await
    }

    async fn install<I: SandboxInstance + ?Sized>(
        &self,
        instance: &I,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut process = instance
            .spawn(&self.config.install_command)
            .await
            .map_err(|e| Error::Sandbox(format!("failed to spawn install: {}", e)))?;
        check_cancelled(cancel)?;

        let mut tail = OutputTail::new(self.config.diagnostic_lines());
        let deadline = deadline_after(self.config.install_timeout());
        let mut output_open = true;

        let exit_code = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(timeout_secs = self.config.install_timeout_secs, "install timed out");
                    return Err(Error::Install { exit_code: None, diagnostics: tail.render() });
                }
                line = process.output.recv(), if output_open => match line {
                    Some(line) => {
                        tracing::debug!(line = %line, "install output");
                        tail.push(line);
                    }
                    None => output_open = false,
                },
                code = &mut process.exit => {
                    break code.map_err(|e| Error::Install {
                        exit_code: None,
                        diagnostics: e.to_string(),
                    })?;
                }
            }
        };

        while let Ok(line) = process.output.try_recv() {
            tracing::debug!(line = %line, "install output");
            tail.push(line);
        }

        if exit_code != 0 {
            return Err(Error::Install {
                exit_code: Some(exit_code),
                diagnostics: tail.render(),
            });
        }
        Ok(())
    }

    async fn start<I: SandboxInstance + ?Sized>(
        &self,
        instance: &I,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Subscribe first so an event fired right after spawn is not missed.
        let mut ready_rx = instance.server_ready();
        let mut process = instance
            .spawn(&self.config.start_command)
            .await
            .map_err(|e| Error::Sandbox(format!("failed to spawn dev server: {}", e)))?;
        check_cancelled(cancel)?;

        let marker = self.config.ready_marker();
        let mut marker_seen = marker.is_none();
        let mut ready: Option<ServerReady> = None;
        let mut tail = OutputTail::new(self.config.diagnostic_lines());
        let deadline = deadline_after(self.config.start_timeout());
        let mut output_open = true;
        let mut events_open = true;

        loop {
            if marker_seen {
                if let Some(event) = ready.take() {
                    spawn_output_logger(process);
                    return Ok(event.url);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        timeout_secs = self.config.start_timeout_secs,
                        marker_seen,
                        "dev server did not become ready"
                    );
                    return Err(Error::StartTimeout { diagnostics: tail.render() });
                }
                line = process.output.recv(), if output_open => match line {
                    Some(line) => {
                        tracing::debug!(line = %line, "server output");
                        if marker.is_some_and(|m| line.contains(m)) {
                            marker_seen = true;
                        }
                        tail.push(line);
                    }
                    None => output_open = false,
                },
                event = ready_rx.recv(), if events_open => match event {
                    Ok(event) => {
                        tracing::debug!(port = event.port, url = %event.url, "server-ready event");
                        ready = Some(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "missed server-ready events");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
            }
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(MAX_STEP_TIMEOUT_SECS))
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Keeps logging a running server's output after it became ready.
fn spawn_output_logger(process: SandboxProcess) {
    let SandboxProcess { mut output, exit } = process;
    tokio::spawn(async move {
        while let Some(line) = output.recv().await {
            tracing::debug!(line = %line, "server output");
        }
        match exit.await {
            Ok(code) => tracing::info!(code, "dev server exited"),
            Err(e) => tracing::debug!(error = %e, "dev server exit unknown"),
        }
    });
}
