//! Preview controller.
//!
//! [`PreviewController`] turns a stream of project tree submissions into one
//! authoritative [`PreviewState`]. Submissions are debounced, every new one
//! supersedes the run in flight, and only the newest run may commit its
//! outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PreviewConfig;
use crate::error::{Error, Result};
use crate::materialize::Materializer;
use crate::pipeline::{ExecutionPipeline, RunRequest};
use crate::sandbox::{SandboxRuntime, SessionManager};
use crate::tree::ProjectTree;

/// What the consumer should render.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PreviewState {
    /// Nothing submitted yet.
    #[default]
    Idle,
    /// A run is in flight.
    Loading,
    /// The dev server is reachable at this address.
    Ready(String),
    /// The newest run failed.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// Tail of the captured process output, if any.
        diagnostics: Option<String>,
    },
}

impl PreviewState {
    /// Builds the failed state for an error.
    pub fn failed(err: &Error) -> Self {
        PreviewState::Failed {
            reason: err.to_string(),
            diagnostics: err.diagnostics().map(str::to_string),
        }
    }

    /// Returns the preview address when ready.
    pub fn url(&self) -> Option<&str> {
        match self {
            PreviewState::Ready(url) => Some(url),
            _ => None,
        }
    }

    /// Returns the failure reason when failed.
    pub fn reason(&self) -> Option<&str> {
        match self {
            PreviewState::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Returns true for `Ready` and `Failed`.
    pub fn is_settled(&self) -> bool {
        matches!(self, PreviewState::Ready(_) | PreviewState::Failed { .. })
    }
}

impl std::fmt::Display for PreviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewState::Idle => write!(f, "idle"),
            PreviewState::Loading => write!(f, "loading"),
            PreviewState::Ready(url) => write!(f, "ready at {}", url),
            PreviewState::Failed { reason, .. } => write!(f, "failed: {}", reason),
        }
    }
}

/// Scheduling phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    /// No submission waiting and no run in flight.
    Idle,
    /// A debounce timer is armed.
    Pending,
    /// A run is in flight.
    Running,
}

struct Schedule {
    generation: u64,
    phase: SchedulePhase,
    timer: Option<JoinHandle<()>>,
    active: Option<CancellationToken>,
    shut_down: bool,
}

impl Schedule {
    /// Drops pending and in-flight work without touching the generation.
    fn supersede(&mut self) {
        if let Some(timer) = self.timer.take() {
            // Once running, the timer task is the run itself and must unwind
            // through its token instead.
            if self.phase == SchedulePhase::Pending {
                timer.abort();
            }
        }
        if let Some(token) = self.active.take() {
            token.cancel();
        }
        self.phase = SchedulePhase::Idle;
    }
}

struct Shared<R: SandboxRuntime> {
    session: SessionManager<R>,
    pipeline: ExecutionPipeline,
    materializer: Materializer,
    debounce: Duration,
    reset_on_run: bool,
    state_tx: watch::Sender<PreviewState>,
    schedule: Mutex<Schedule>,
    runs_started: AtomicU64,
}

impl<R: SandboxRuntime> Shared<R> {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the run slot for `generation`, or returns `None` if superseded.
    fn begin(&self, generation: u64) -> Option<CancellationToken> {
        let mut schedule = self.schedule();
        if schedule.shut_down || schedule.generation != generation {
            return None;
        }
        let token = CancellationToken::new();
        schedule.phase = SchedulePhase::Running;
        // Detach: this task is the run now.
        schedule.timer = None;
        schedule.active = Some(token.clone());
        self.state_tx.send_replace(PreviewState::Loading);
        Some(token)
    }

    async fn execute(self: Arc<Self>, generation: u64, tree: ProjectTree) {
        let Some(token) = self.begin(generation) else {
            tracing::debug!(generation, "debounced run superseded before start");
            return;
        };
        self.runs_started.fetch_add(1, Ordering::SeqCst);

        let files = self.materializer.materialize(&tree);
        tracing::info!(
            generation,
            files = files.len(),
            bytes = files.total_bytes(),
            "starting preview run"
        );
        let request = RunRequest::new(generation, files, self.reset_on_run);

        let outcome = self.run(&request, &token).await;
        if let Err(e) = &outcome {
            if e.invalidates_session() && !token.is_cancelled() {
                self.session.invalidate().await;
            }
        }
        self.commit(generation, &token, outcome);
    }

    async fn run(&self, request: &RunRequest, token: &CancellationToken) -> Result<String> {
        let instance = self.session.acquire(request.reset).await?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.pipeline.run(instance.as_ref(), request, token).await
    }

    fn commit(&self, generation: u64, token: &CancellationToken, outcome: Result<String>) {
        let mut schedule = self.schedule();
        if token.is_cancelled() || schedule.generation != generation {
            tracing::debug!(generation, newest = schedule.generation, "discarding stale outcome");
            return;
        }
        schedule.phase = SchedulePhase::Idle;
        schedule.active = None;

        let state = match outcome {
            Ok(url) => PreviewState::Ready(url),
            Err(Error::Cancelled) => return,
            Err(e) => PreviewState::failed(&e),
        };
        tracing::info!(generation, state = %state, "preview state committed");
        self.state_tx.send_replace(state);
    }
}

/// Drives preview runs for a stream of generated projects.
pub struct PreviewController<R: SandboxRuntime> {
    shared: Arc<Shared<R>>,
}

impl<R: SandboxRuntime> PreviewController<R> {
    /// Creates a controller owning a fresh session on `runtime`.
    pub fn new(runtime: R, config: PreviewConfig) -> Self {
        let (state_tx, _) = watch::channel(PreviewState::Idle);
        let debounce = config.debounce();
        let shared = Shared {
            session: SessionManager::new(runtime),
            pipeline: ExecutionPipeline::new(config.pipeline),
            materializer: Materializer::new(config.materializer),
            debounce,
            reset_on_run: config.reset_on_run,
            state_tx,
            schedule: Mutex::new(Schedule {
                generation: 0,
                phase: SchedulePhase::Idle,
                timer: None,
                active: None,
                shut_down: false,
            }),
            runs_started: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.shared.state_tx.subscribe()
    }

    /// Returns the current state.
    pub fn state(&self) -> PreviewState {
        self.shared.state_tx.borrow().clone()
    }

    /// Returns the current scheduling phase.
    pub fn phase(&self) -> SchedulePhase {
        self.shared.schedule().phase
    }

    /// Returns the newest generation handed out.
    pub fn generation(&self) -> u64 {
        self.shared.schedule().generation
    }

    /// Number of runs that got past the debounce window.
    pub fn runs_started(&self) -> u64 {
        self.shared.runs_started.load(Ordering::SeqCst)
    }

    /// Returns the sandbox session.
    pub fn session(&self) -> &SessionManager<R> {
        &self.shared.session
    }

    /// Schedules a run for `tree` after the debounce window.
    ///
    /// Returns the generation assigned to this submission. Any pending or
    /// in-flight run is superseded.
    pub fn submit(&self, tree: ProjectTree) -> u64 {
        let mut schedule = self.shared.schedule();
        if schedule.shut_down {
            tracing::warn!("submission after shutdown ignored");
            return schedule.generation;
        }

        schedule.supersede();
        schedule.generation += 1;
        let generation = schedule.generation;
        schedule.phase = SchedulePhase::Pending;

        let shared = Arc::clone(&self.shared);
        let debounce = self.shared.debounce;
        schedule.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            shared.execute(generation, tree).await;
        }));

        tracing::debug!(generation, "preview run scheduled");
        generation
    }

    /// Parses the generator's JSON and schedules a run for it.
    ///
    /// A malformed tree supersedes pending work and is surfaced as
    /// [`PreviewState::Failed`] without starting a run.
    pub fn submit_json(&self, raw: &str) -> Result<u64> {
        match ProjectTree::from_json(raw) {
            Ok(tree) => Ok(self.submit(tree)),
            Err(e) => {
                let mut schedule = self.shared.schedule();
                if !schedule.shut_down {
                    schedule.supersede();
                    schedule.generation += 1;
                    tracing::warn!(error = %e, "rejected generated project");
                    self.shared.state_tx.send_replace(PreviewState::failed(&e));
                }
                Err(e)
            }
        }
    }

    /// Cancels the active run and the debounce timer.
    ///
    /// The controller ignores submissions afterwards. The sandbox itself is
    /// left to [`SessionManager::teardown`].
    pub fn shutdown(&self) {
        let mut schedule = self.shared.schedule();
        if schedule.shut_down {
            return;
        }
        schedule.shut_down = true;
        schedule.supersede();
        tracing::debug!(generation = schedule.generation, "preview controller shut down");
    }
}

impl<R: SandboxRuntime> Drop for PreviewController<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{MemoryRuntime, ProcessBehavior, RuntimeEvent};
    use crate::tree::Node;

    fn app(version: &str) -> ProjectTree {
        ProjectTree::new(vec![Node::file(
            "App.tsx",
            format!("export default () => <p>{}</p>;", version),
        )])
        .unwrap()
    }

    async fn settled(controller: &PreviewController<MemoryRuntime>) -> PreviewState {
        let mut rx = controller.subscribe();
        let state = rx.wait_for(PreviewState::is_settled).await.unwrap();
        state.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_submissions_run_once_with_latest_tree() {
        let runtime = MemoryRuntime::new();
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        for i in 0..10 {
            controller.submit(app(&format!("v{}", i)));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(settled(&controller).await, PreviewState::Ready("http://localhost:5173".into()));
        assert_eq!(controller.runs_started(), 1);
        let mounts = runtime.mounts();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].get("src_App.tsx").unwrap().contains("v9"));
    }

    #[tokio::test(start_paused = true)]
    async fn loading_is_published_only_once_a_run_starts() {
        let runtime = MemoryRuntime::new().with_boot_delay(Duration::from_secs(1));
        let controller = PreviewController::new(runtime, PreviewConfig::default());

        controller.submit(ProjectTree::empty());
        assert_eq!(controller.phase(), SchedulePhase::Pending);
        assert_eq!(controller.state(), PreviewState::Idle);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(controller.phase(), SchedulePhase::Running);
        assert_eq!(controller.state(), PreviewState::Loading);

        settled(&controller).await;
        assert_eq!(controller.phase(), SchedulePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_run_never_commits() {
        let runtime = MemoryRuntime::new();
        runtime.on_command(
            "npm install",
            ProcessBehavior::exit(0).with_delay(Duration::from_secs(2)),
        );
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(app("first"));
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(controller.phase(), SchedulePhase::Running);

        let second = controller.submit(app("second"));
        let state = settled(&controller).await;

        assert!(state.url().is_some());
        assert_eq!(controller.generation(), second);
        assert_eq!(controller.runs_started(), 2);
        let mounts = runtime.mounts();
        assert_eq!(mounts.len(), 2);
        assert!(mounts[1].get("src_App.tsx").unwrap().contains("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn install_failure_is_surfaced_and_instance_kept() {
        let runtime = MemoryRuntime::new();
        runtime.on_command(
            "npm install",
            ProcessBehavior::exit(1).with_output(&["npm ERR! missing script"]),
        );
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(ProjectTree::empty());
        let state = settled(&controller).await;

        assert_eq!(state.reason(), Some("Failed to install dependencies"));
        match state {
            PreviewState::Failed { diagnostics, .. } => {
                assert_eq!(diagnostics.as_deref(), Some("npm ERR! missing script"))
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(controller.session().is_ready().await);
        assert_eq!(runtime.teardown_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_failure_is_retried_on_next_submission() {
        let runtime = MemoryRuntime::new().with_boot_failures(1);
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(ProjectTree::empty());
        let state = settled(&controller).await;
        assert!(state.reason().unwrap().starts_with("failed to boot sandbox"));

        controller.submit(ProjectTree::empty());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(settled(&controller).await.url().is_some());
        assert_eq!(runtime.boot_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_run_resets_the_instance() {
        let runtime = MemoryRuntime::new();
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(app("a"));
        settled(&controller).await;
        controller.submit(app("b"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        settled(&controller).await;

        assert_eq!(
            runtime.lifecycle_events(),
            vec![
                RuntimeEvent::Boot(1),
                RuntimeEvent::Teardown(1),
                RuntimeEvent::Boot(2)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_json_fails_without_running() {
        let runtime = MemoryRuntime::new();
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        let err = controller
            .submit_json(r#"[{"name": "App.tsx", "type": "file"}]"#)
            .unwrap_err();

        assert!(matches!(err, Error::GenerationInput(_)));
        assert!(controller.state().reason().unwrap().contains("App.tsx"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.runs_started(), 0);
        assert_eq!(runtime.boot_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_json_supersedes_pending_submission() {
        let runtime = MemoryRuntime::new();
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(ProjectTree::empty());
        assert!(controller.submit_json("{}").is_err());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(controller.runs_started(), 0);
        assert_eq!(controller.phase(), SchedulePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn run_superseded_while_starting_never_commits_its_address() {
        let runtime = MemoryRuntime::new();
        runtime.on_command(
            "npm run dev",
            ProcessBehavior::serve(5173, "http://localhost:5173").with_delay(Duration::from_secs(2)),
        );
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            let mut rx = controller.subscribe();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let state = rx.borrow_and_update().clone();
                    seen.lock().unwrap().push(state);
                }
            })
        };

        controller.submit(app("first"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runtime.spawned_commands(), vec!["npm install", "npm run dev"]);
        assert_eq!(controller.state(), PreviewState::Loading);

        runtime.on_command("npm run dev", ProcessBehavior::serve(5174, "http://localhost:5174"));
        controller.submit(app("second"));
        assert_eq!(settled(&controller).await.url(), Some("http://localhost:5174"));

        // Well past the moment the first server would have announced itself.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.state().url(), Some("http://localhost:5174"));
        assert!(!seen
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.url() == Some("http://localhost:5173")));
        recorder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timer() {
        let runtime = MemoryRuntime::new();
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(ProjectTree::empty());
        controller.shutdown();
        controller.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(controller.runs_started(), 0);
        assert!(runtime.mounts().is_empty());
        assert_eq!(controller.phase(), SchedulePhase::Idle);

        controller.submit(ProjectTree::empty());
        assert_eq!(controller.phase(), SchedulePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_run_discards_outcome() {
        let runtime = MemoryRuntime::new();
        runtime.on_command("npm install", ProcessBehavior::hang(&[]));
        let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

        controller.submit(ProjectTree::empty());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.state(), PreviewState::Loading);

        controller.shutdown();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(controller.state(), PreviewState::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_controller_cancels_pending_run() {
        let runtime = MemoryRuntime::new();
        {
            let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());
            controller.submit(ProjectTree::empty());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(runtime.boot_count(), 0);
    }
}
