//! Host-process sandbox runtime.
//!
//! Each instance is a private temporary directory. Mounted keys become
//! relative paths inside it and commands run as child processes with that
//! directory as their working directory. Server readiness is detected by
//! spotting an `http(s)://host:port` address in process output and confirming
//! the port accepts TCP connections.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::materialize::MaterializedFileSet;

use super::runtime::{SandboxInstance, SandboxProcess, SandboxRuntime, ServerReady};

/// Attempts made to connect to an announced port before giving up.
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Runtime that runs commands as host processes in a temp directory.
#[derive(Debug, Clone, Default)]
pub struct LocalRuntime {
    /// Parent directory for instances. If None, uses the system temp dir.
    base_dir: Option<PathBuf>,
}

impl LocalRuntime {
    /// Creates a runtime that places instances in the system temp dir.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runtime that places instances under `base_dir`.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            base_dir: Some(base_dir),
        }
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    type Instance = LocalInstance;

    async fn boot(&self) -> Result<LocalInstance> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("preview-sandbox-");

        let dir = match &self.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| Error::Boot(format!("failed to create sandbox directory: {}", e)))?;

        let instance = LocalInstance::new(dir);
        tracing::debug!(instance = %instance.id, root = ?instance.root, "created local sandbox");
        Ok(instance)
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Instance booted by [`LocalRuntime`].
pub struct LocalInstance {
    id: String,
    root: PathBuf,
    dir: Mutex<Option<TempDir>>,
    /// Cancelled to kill every process spawned since the last kill.
    processes: Mutex<CancellationToken>,
    /// Process groups led by those processes; grandchildren live here too.
    groups: Mutex<Vec<u32>>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalInstance {
    fn new(dir: TempDir) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            root: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            processes: Mutex::new(CancellationToken::new()),
            groups: Mutex::new(Vec::new()),
            ready_tx,
        }
    }

    /// Returns the directory files are mounted into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn process_token(&self) -> CancellationToken {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Kills every process spawned since the last kill, descendants included.
    fn kill_spawned(&self) {
        let groups = std::mem::take(&mut *self.groups.lock().unwrap_or_else(|e| e.into_inner()));
        for pgid in groups {
            kill_group(pgid);
        }

        let mut token = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }

    fn ensure_alive(&self) -> Result<()> {
        let alive = self
            .dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if alive {
            Ok(())
        } else {
            Err(Error::Sandbox(format!("{} was torn down", self.id)))
        }
    }

    fn resolve_key(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(Error::Sandbox(format!(
                "mount key '{}' must be a relative path",
                key
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl Drop for LocalInstance {
    fn drop(&mut self) {
        self.kill_spawned();
    }
}

#[async_trait]
impl SandboxInstance for LocalInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, files: &MaterializedFileSet) -> Result<()> {
        self.ensure_alive()?;

        let targets = files
            .iter()
            .map(|(key, content)| self.resolve_key(key).map(|path| (path, content)))
            .collect::<Result<Vec<_>>>()?;

        for (path, content) in targets {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }

        tracing::debug!(instance = %self.id, files = files.len(), "mounted files");
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess> {
        self.ensure_alive()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&self.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Own group per child so a kill also reaches what it forks (npm -> vite).
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn '{}': {}", command, e)))?;
        if let Some(pid) = child.id() {
            self.groups
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(pid);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("stderr was not piped".to_string()))?;

        tracing::debug!(instance = %self.id, command = %command, pid = ?child.id(), "spawned process");

        let (output_tx, output_rx) = mpsc::channel(256);
        let (exit_tx, exit_rx) = oneshot::channel();
        let supervisor = Supervisor {
            output_tx,
            ready_tx: self.ready_tx.clone(),
            token: self.process_token(),
            announced: HashSet::new(),
        };
        tokio::spawn(supervisor.run(child, stdout, stderr, exit_tx));

        Ok(SandboxProcess::new(output_rx, async move {
            exit_rx
                .await
                .map_err(|_| Error::Sandbox("process supervisor dropped".to_string()))
        }))
    }

    async fn kill_processes(&self) -> Result<()> {
        self.kill_spawned();
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.kill_spawned();

        let dir = self.dir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dir) = dir {
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|e| Error::Teardown(format!("cleanup task failed: {}", e)))?
                .map_err(|e| Error::Teardown(format!("failed to remove {:?}: {}", self.root, e)))?;
        }
        Ok(())
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

/// Forwards one child's output and reports its exit.
struct Supervisor {
    output_tx: mpsc::Sender<String>,
    ready_tx: broadcast::Sender<ServerReady>,
    token: CancellationToken,
    announced: HashSet<u16>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        stdout: ChildStdout,
        stderr: ChildStderr,
        exit_tx: oneshot::Sender<i32>,
    ) {
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let token = self.token.clone();

        while stdout_open || stderr_open {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(error = %e, "failed to kill sandbox process");
                    }
                    let _ = exit_tx.send(-1);
                    return;
                }
                line = stdout_reader.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => self.forward(line).await,
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::debug!(error = %e, "error reading stdout");
                        stdout_open = false;
                    }
                },
                line = stderr_reader.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => self.forward(line).await,
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        tracing::debug!(error = %e, "error reading stderr");
                        stderr_open = false;
                    }
                },
            }
        }

        let code = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                -1
            }
            status = child.wait() => match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::debug!(error = %e, "failed to wait for sandbox process");
                    -1
                }
            },
        };
        let _ = exit_tx.send(code);
    }

    async fn forward(&mut self, line: String) {
        if let Some(ready) = extract_server_url(&line) {
            if self.announced.insert(ready.port) {
                tokio::spawn(announce_when_reachable(ready, self.ready_tx.clone()));
            }
        }
        // The receiver may be gone once the pipeline stops listening.
        let _ = self.output_tx.send(line).await;
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pgid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

async fn announce_when_reachable(ready: ServerReady, ready_tx: broadcast::Sender<ServerReady>) {
    for _ in 0..CONNECT_ATTEMPTS {
        if TcpStream::connect(("127.0.0.1", ready.port)).await.is_ok() {
            tracing::debug!(port = ready.port, url = %ready.url, "server accepting connections");
            let _ = ready_tx.send(ready);
            return;
        }
        tokio::time::sleep(CONNECT_INTERVAL).await;
    }
    tracing::debug!(port = ready.port, "announced port never accepted connections");
}

/// Removes ANSI escape sequences (colors, cursor movement).
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Finds the first `http(s)://host:port` address in a line of output.
fn extract_server_url(line: &str) -> Option<ServerReady> {
    let clean = strip_ansi(line);
    let start = clean.find("http://").or_else(|| clean.find("https://"))?;
    let url: String = clean[start..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    let url = url.trim_end_matches(|c: char| matches!(c, ',' | '.' | ')' | ';'));

    let authority = url.split("://").nth(1)?.split('/').next()?;
    let port = authority.rsplit_once(':')?.1.parse().ok()?;

    Some(ServerReady {
        port,
        url: url.to_string(),
    })
}
