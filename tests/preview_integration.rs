//! Integration tests for the preview controller and pipeline.
//!
//! Most tests drive the scripted in-memory runtime with paused time. The
//! local runtime test spawns real host processes and is unix-only.

use std::time::Duration;

use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use preview_orchestrator::{
    MemoryRuntime, PreviewConfig, PreviewController, PreviewState, ProcessBehavior, SCAFFOLD_KEYS,
};

const GENERATED_PROJECT: &str = r##"[
    {"name": "src", "type": "directory", "children": [
        {"name": "App.tsx", "type": "file", "content": "export default function App() { return <h1>Hi</h1>; }"},
        {"name": "components", "type": "folder", "children": [
            {"name": "Card.tsx", "type": "file", "content": "export const Card = () => null;"}
        ]}
    ]},
    {"name": "server", "type": "directory", "children": [
        {"name": "index.js", "type": "file", "content": "require('express')();"}
    ]},
    {"name": "tailwind.config.js", "type": "file", "content": "module.exports = {};"},
    {"name": "README.md", "type": "file", "content": "# generated"},
    {"name": "public", "type": "directory", "children": []}
]"##;

async fn settled(controller: &PreviewController<MemoryRuntime>) -> PreviewState {
    let mut states = controller.subscribe();
    let state = states
        .wait_for(PreviewState::is_settled)
        .await
        .expect("controller dropped");
    state.clone()
}

#[tokio::test(start_paused = true)]
async fn generated_project_reaches_ready() {
    let runtime = MemoryRuntime::new();
    let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

    assert_ok!(controller.submit_json(GENERATED_PROJECT));
    let state = settled(&controller).await;

    assert_eq!(state.url(), Some("http://localhost:5173"));
    let mounts = runtime.mounts();
    assert_eq!(mounts.len(), 1);
    let files = &mounts[0];
    assert!(files.contains_key("src_src_App.tsx"));
    assert!(files.contains_key("src_src_components_Card.tsx"));
    assert!(files.contains_key("tailwind.config.js"));
    assert!(!files.keys().any(|k| k.contains("server")));
    assert!(!files.keys().any(|k| k.ends_with(".md")));
    assert_eq!(
        runtime.spawned_commands(),
        vec!["npm install", "npm run dev"]
    );
}

#[tokio::test(start_paused = true)]
async fn empty_project_runs_scaffold_only() {
    let runtime = MemoryRuntime::new();
    let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

    assert_ok!(controller.submit_json("[]"));
    let state = settled(&controller).await;

    assert!(state.url().is_some());
    let files = &runtime.mounts()[0];
    assert_eq!(files.len(), SCAFFOLD_KEYS.len());
    for key in SCAFFOLD_KEYS {
        assert!(files.contains_key(key), "missing scaffold key {}", key);
    }
}

#[tokio::test(start_paused = true)]
async fn install_exit_code_fails_within_timeout() {
    let runtime = MemoryRuntime::new();
    runtime.on_command("npm install", ProcessBehavior::exit(1));
    let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

    let started = Instant::now();
    assert_ok!(controller.submit_json("[]"));
    let state = settled(&controller).await;

    assert_eq!(state.reason(), Some("Failed to install dependencies"));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(runtime.live_instances(), 1);
    assert_eq!(runtime.teardown_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_ready_marker_times_out_at_sixty_seconds() {
    let runtime = MemoryRuntime::new();
    runtime.on_command(
        "npm run dev",
        ProcessBehavior::hang(&["  VITE v4.5.0  ready in 312 ms"]),
    );
    let controller = PreviewController::new(runtime, PreviewConfig::default());

    let started = Instant::now();
    assert_ok!(controller.submit_json("[]"));
    let state = settled(&controller).await;

    assert_eq!(state.reason(), Some("Server start timeout"));
    // Debounce plus the start timeout.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(60_500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(61_000), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn second_submission_within_debounce_replaces_first() {
    let runtime = MemoryRuntime::new();
    let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

    let first = r#"[{"name": "App.tsx", "type": "file", "content": "first"}]"#;
    let second = r#"[{"name": "App.tsx", "type": "file", "content": "second"}]"#;

    assert_ok!(controller.submit_json(first));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ok!(controller.submit_json(second));
    settled(&controller).await;

    let mounts = runtime.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].get("src_App.tsx"), Some("second"));
    assert_eq!(controller.runs_started(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_project_is_rejected_without_run() {
    let runtime = MemoryRuntime::new();
    let controller = PreviewController::new(runtime.clone(), PreviewConfig::default());

    assert_err!(controller.submit_json(
        r#"[{"name": "src", "type": "directory", "children": "App.tsx"}]"#
    ));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(controller.state().reason().is_some());
    assert_eq!(runtime.boot_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn custom_debounce_from_toml() {
    let config = assert_ok!(PreviewConfig::from_toml_str("debounce_ms = 50\n"));
    let runtime = MemoryRuntime::new();
    let controller = PreviewController::new(runtime.clone(), config);

    let started = Instant::now();
    assert_ok!(controller.submit_json("[]"));
    settled(&controller).await;

    assert!(started.elapsed() < Duration::from_millis(500));
}

#[cfg(unix)]
mod local {
    use tokio_util::sync::CancellationToken;

    use preview_orchestrator::{
        CommandSpec, ExecutionPipeline, LocalRuntime, Materializer, PipelineConfig, ProjectTree,
        RunRequest, SandboxInstance, SandboxRuntime,
    };

    #[tokio::test]
    async fn local_pipeline_serves_reachable_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let script = format!(
            "echo '  ➜  Network: http://127.0.0.1:{}/'; sleep 30",
            port
        );

        let base = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::with_base_dir(base.path().to_path_buf());
        let instance = runtime.boot().await.unwrap();
        let pipeline = ExecutionPipeline::new(PipelineConfig {
            install_command: CommandSpec::new("true", &[]),
            start_command: CommandSpec::new("sh", &["-c", &script]),
            install_timeout_secs: 10,
            start_timeout_secs: 10,
            ..Default::default()
        });
        let files = Materializer::default().materialize(&ProjectTree::empty());

        let url = pipeline
            .run(&instance, &RunRequest::new(1, files, false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(url, format!("http://127.0.0.1:{}/", port));
        assert!(instance.root().join("package.json").exists());

        instance.teardown().await.unwrap();
        assert!(!instance.root().exists());
    }
}
