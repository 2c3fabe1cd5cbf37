//! Runtime traits for sandboxed execution environments.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::config::CommandSpec;
use crate::error::Result;
use crate::materialize::MaterializedFileSet;

/// Resolves to the exit code of a sandboxed process.
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<i32>> + Send>>;

/// Notification that a server inside the sandbox bound a routable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    /// Port the server listens on.
    pub port: u16,
    /// Address a browser can open.
    pub url: String,
}

/// A process running inside a sandbox instance.
pub struct SandboxProcess {
    /// Output chunks (stdout and stderr interleaved).
    pub output: mpsc::Receiver<String>,
    /// Completes when the process exits.
    pub exit: ExitFuture,
}

impl SandboxProcess {
    /// Wraps an output channel and an exit future.
    pub fn new(
        output: mpsc::Receiver<String>,
        exit: impl Future<Output = Result<i32>> + Send + 'static,
    ) -> Self {
        Self {
            output,
            exit: Box::pin(exit),
        }
    }
}

impl std::fmt::Debug for SandboxProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxProcess").finish_non_exhaustive()
    }
}

/// A live, stateful handle to one sandbox.
#[async_trait]
pub trait SandboxInstance: Send + Sync + 'static {
    /// Returns an identifier for log correlation.
    fn id(&self) -> &str;

    /// Writes every entry of `files` into the sandbox in one call.
    async fn mount(&self, files: &MaterializedFileSet) -> Result<()>;

    /// Starts a process inside the sandbox.
    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess>;

    /// Terminates processes left over from earlier runs.
    async fn kill_processes(&self) -> Result<()>;

    /// Destroys the sandbox. The instance is unusable afterwards.
    async fn teardown(&self) -> Result<()>;

    /// Subscribes to server-ready notifications.
    ///
    /// Only events emitted after the call are delivered.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

/// Boots sandbox instances.
#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    /// The instance type this runtime boots.
    type Instance: SandboxInstance;

    /// Boots a fresh instance.
    async fn boot(&self) -> Result<Self::Instance>;

    /// Returns the name of this runtime.
    fn name(&self) -> &str;
}
