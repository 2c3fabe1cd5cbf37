//! Preview Orchestrator CLI
//!
//! Runs one generated project through the preview pipeline and keeps the
//! dev server alive until interrupted.

use std::path::Path;

use preview_orchestrator::{
    LocalRuntime, MemoryRuntime, PreviewConfig, PreviewController, PreviewState, SandboxRuntime,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Parse args (basic: project tree plus optional config)
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <project.json> [config.toml]", args[0]);
        eprintln!("\nMaterializes a generated project and serves a live preview.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  PREVIEW_RUNTIME=local|memory  Select sandbox runtime (default: local)");
        std::process::exit(1);
    }

    let config = match args.get(2) {
        Some(path) => match PreviewConfig::load(Path::new(path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Invalid config: {}", e);
                std::process::exit(1);
            }
        },
        None => PreviewConfig::default(),
    };

    let raw = match tokio::fs::read_to_string(&args[1]).await {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Failed to read {}: {}", args[1], e);
            std::process::exit(1);
        }
    };

    // Select runtime based on environment variable
    let runtime_name = std::env::var("PREVIEW_RUNTIME").unwrap_or_else(|_| "local".to_string());
    let code = match runtime_name.as_str() {
        "memory" => {
            tracing::info!("using in-memory runtime");
            serve(MemoryRuntime::new(), config, &raw).await
        }
        _ => {
            tracing::info!("using local runtime");
            serve(LocalRuntime::new(), config, &raw).await
        }
    };

    std::process::exit(code);
}

async fn serve<R: SandboxRuntime>(runtime: R, config: PreviewConfig, raw: &str) -> i32 {
    let controller = PreviewController::new(runtime, config);
    let mut states = controller.subscribe();

    if let Err(e) = controller.submit_json(raw) {
        eprintln!("Invalid project: {}", e);
        return 1;
    }

    let state = match states.wait_for(PreviewState::is_settled).await {
        Ok(state) => state.clone(),
        Err(_) => {
            eprintln!("Preview controller stopped");
            return 1;
        }
    };

    let code = match &state {
        PreviewState::Ready(url) => {
            println!("\n{}", "=".repeat(60));
            println!("Preview Ready");
            println!("{}", "=".repeat(60));
            println!();
            println!("URL: {}", url);
            println!();
            println!("Press Ctrl-C to stop.");

            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
            0
        }
        PreviewState::Failed {
            reason,
            diagnostics,
        } => {
            eprintln!("Preview failed: {}", reason);
            if let Some(diagnostics) = diagnostics {
                eprintln!();
                eprintln!("{}", diagnostics);
            }
            1
        }
        _ => 1,
    };

    controller.shutdown();
    if let Err(e) = controller.session().teardown().await {
        tracing::warn!(error = %e, "sandbox teardown failed");
    }
    code
}
