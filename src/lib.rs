//! Preview Orchestrator - sandboxed live preview for generated web projects
//!
//! This library turns generated project trees into runnable front-end projects,
//! drives them through mount, install and dev-server start inside a single
//! sandbox instance, and publishes the resulting preview state.

pub mod config;
pub mod error;
pub mod materialize;
pub mod pipeline;
pub mod preview;
pub mod sandbox;
pub mod tree;

pub use config::{
    CommandSpec, MaterializerConfig, PipelineConfig, PreviewConfig, Validate, ValidationResult,
};
pub use error::{Error, Result};
pub use materialize::{scaffold, MaterializedFileSet, Materializer, SCAFFOLD_KEYS};
pub use pipeline::{ExecutionPipeline, PipelineStage, RunRequest};
pub use preview::{PreviewController, PreviewState, SchedulePhase};
pub use sandbox::{
    LocalRuntime, MemoryRuntime, ProcessBehavior, RuntimeEvent, SandboxInstance, SandboxProcess,
    SandboxRuntime, ServerReady, SessionManager,
};
pub use tree::{Node, ProjectTree};
