//! Sandbox module for isolated preview execution environments.
//!
//! This module provides the [`SandboxRuntime`] and [`SandboxInstance`] traits
//! for the external execution environment, the [`SessionManager`] that owns
//! the single live instance, and two runtimes: [`LocalRuntime`] backed by host
//! processes and [`MemoryRuntime`] for scripted runs.

pub mod local;
pub mod memory;
mod runtime;
mod session;

pub use local::{LocalInstance, LocalRuntime};
pub use memory::{MemoryInstance, MemoryRuntime, ProcessBehavior, RuntimeEvent};
pub use runtime::{ExitFuture, SandboxInstance, SandboxProcess, SandboxRuntime, ServerReady};
pub use session::SessionManager;
