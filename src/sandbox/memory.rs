//! Scripted in-memory sandbox runtime.
//!
//! [`MemoryRuntime`] never touches the host. Commands follow scripted
//! [`ProcessBehavior`]s and every call is recorded as a [`RuntimeEvent`], which
//! makes it the runtime of choice for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::materialize::{MaterializedFileSet, DEV_SERVER_PORT};

use super::runtime::{SandboxInstance, SandboxProcess, SandboxRuntime, ServerReady};

/// How a scripted command behaves once spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessBehavior {
    /// Prints `output` after `delay` and exits with `code`.
    Exit {
        code: i32,
        output: Vec<String>,
        delay: Duration,
    },
    /// Prints `output` after `delay`, then announces `ready` and keeps running.
    Serve {
        output: Vec<String>,
        ready: Option<ServerReady>,
        delay: Duration,
    },
    /// Prints `output` and never exits.
    Hang { output: Vec<String> },
}

impl ProcessBehavior {
    /// A command that exits immediately with `code`.
    pub fn exit(code: i32) -> Self {
        ProcessBehavior::Exit {
            code,
            output: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    /// A dev server that prints the usual banner and becomes ready at `url`.
    pub fn serve(port: u16, url: impl Into<String>) -> Self {
        let url = url.into();
        ProcessBehavior::Serve {
            output: vec![
                "  VITE v4.5.0  ready in 312 ms".to_string(),
                format!("  ➜  Local:   http://localhost:{}/", port),
                format!("  ➜  Network: {}", url),
            ],
            ready: Some(ServerReady { port, url }),
            delay: Duration::ZERO,
        }
    }

    /// A command that prints `output` and never exits.
    pub fn hang(output: &[&str]) -> Self {
        ProcessBehavior::Hang {
            output: output.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replaces the printed output.
    pub fn with_output(mut self, lines: &[&str]) -> Self {
        let lines = lines.iter().map(|s| s.to_string()).collect();
        match &mut self {
            ProcessBehavior::Exit { output, .. }
            | ProcessBehavior::Serve { output, .. }
            | ProcessBehavior::Hang { output } => *output = lines,
        }
        self
    }

    /// Delays output, exit and readiness by `delay`.
    pub fn with_delay(mut self, d: Duration) -> Self {
        match &mut self {
            ProcessBehavior::Exit { delay, .. } | ProcessBehavior::Serve { delay, .. } => {
                *delay = d
            }
            ProcessBehavior::Hang { .. } => {}
        }
        self
    }

    /// Drops the ready announcement of a serving process.
    pub fn without_ready_event(mut self) -> Self {
        if let ProcessBehavior::Serve { ready, .. } = &mut self {
            *ready = None;
        }
        self
    }
}

/// A recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Boot attempt for the given instance number.
    Boot(u64),
    /// Successful teardown.
    Teardown(u64),
    /// Mount call with the mounted keys.
    Mount { instance: u64, keys: Vec<String> },
    /// Spawned command line.
    Spawn { instance: u64, command: String },
    /// Stale-process termination.
    KillProcesses(u64),
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: AtomicU64,
    live: AtomicUsize,
    boot_failures: AtomicUsize,
    teardown_failures: AtomicUsize,
    boot_delay: Mutex<Duration>,
    behaviors: Mutex<HashMap<String, ProcessBehavior>>,
    events: Mutex<Vec<RuntimeEvent>>,
    mounts: Mutex<Vec<MaterializedFileSet>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryState {
    fn record(&self, event: RuntimeEvent) {
        lock(&self.events).push(event);
    }

    fn behavior_for(&self, command: &CommandSpec) -> ProcessBehavior {
        lock(&self.behaviors)
            .get(&command.to_string())
            .cloned()
            .unwrap_or_else(|| ProcessBehavior::exit(0))
    }
}

/// In-memory runtime with scripted process behavior.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<MemoryState>,
}

impl MemoryRuntime {
    /// Creates a runtime where `npm install` succeeds and `npm run dev`
    /// serves on the scaffold's dev server port.
    pub fn new() -> Self {
        let runtime = Self::default();
        runtime.on_command(
            "npm install",
            ProcessBehavior::exit(0).with_output(&["added 187 packages in 4s"]),
        );
        runtime.on_command(
            "npm run dev",
            ProcessBehavior::serve(
                DEV_SERVER_PORT,
                format!("http://localhost:{}", DEV_SERVER_PORT),
            ),
        );
        runtime
    }

    /// Scripts the behavior of a command line such as `"npm install"`.
    pub fn on_command(&self, command: &str, behavior: ProcessBehavior) {
        lock(&self.state.behaviors).insert(command.to_string(), behavior);
    }

    /// Makes every boot take `delay`.
    pub fn with_boot_delay(self, delay: Duration) -> Self {
        *lock(&self.state.boot_delay) = delay;
        self
    }

    /// Makes the next `n` boots fail.
    pub fn with_boot_failures(self, n: usize) -> Self {
        self.state.boot_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Makes the next `n` teardowns fail.
    pub fn with_teardown_failures(self, n: usize) -> Self {
        self.state.teardown_failures.store(n, Ordering::SeqCst);
        self
    }

    /// All recorded events in call order.
    pub fn events(&self) -> Vec<RuntimeEvent> {
        lock(&self.state.events).clone()
    }

    /// Only boot and teardown events.
    pub fn lifecycle_events(&self) -> Vec<RuntimeEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, RuntimeEvent::Boot(_) | RuntimeEvent::Teardown(_)))
            .collect()
    }

    /// Number of boot attempts.
    pub fn boot_count(&self) -> usize {
        self.count(|e| matches!(e, RuntimeEvent::Boot(_)))
    }

    /// Number of successful teardowns.
    pub fn teardown_count(&self) -> usize {
        self.count(|e| matches!(e, RuntimeEvent::Teardown(_)))
    }

    /// Instances booted and not yet torn down.
    pub fn live_instances(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// File sets passed to mount, oldest first.
    pub fn mounts(&self) -> Vec<MaterializedFileSet> {
        lock(&self.state.mounts).clone()
    }

    /// Spawned command lines, oldest first.
    pub fn spawned_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RuntimeEvent::Spawn { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&RuntimeEvent) -> bool) -> usize {
        lock(&self.state.events).iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl SandboxRuntime for MemoryRuntime {
    type Instance = MemoryInstance;

    async fn boot(&self) -> Result<MemoryInstance> {
        let number = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.record(RuntimeEvent::Boot(number));

        let delay = *lock(&self.state.boot_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failures = &self.state.boot_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Boot(format!("scripted boot failure for memory-{}", number)));
        }

        self.state.live.fetch_add(1, Ordering::SeqCst);
        let (ready_tx, _) = broadcast::channel(16);
        Ok(MemoryInstance {
            number,
            id: format!("memory-{}", number),
            state: Arc::clone(&self.state),
            ready_tx,
            torn_down: AtomicBool::new(false),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Instance booted by [`MemoryRuntime`].
#[derive(Debug)]
pub struct MemoryInstance {
    number: u64,
    id: String,
    state: Arc<MemoryState>,
    ready_tx: broadcast::Sender<ServerReady>,
    torn_down: AtomicBool,
}

impl MemoryInstance {
    fn ensure_alive(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(Error::Sandbox(format!("{} was torn down", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxInstance for MemoryInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, files: &MaterializedFileSet) -> Result<()> {
        self.ensure_alive()?;
        self.state.record(RuntimeEvent::Mount {
            instance: self.number,
            keys: files.keys().map(str::to_string).collect(),
        });
        lock(&self.state.mounts).push(files.clone());
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SandboxProcess> {
        self.ensure_alive()?;
        self.state.record(RuntimeEvent::Spawn {
            instance: self.number,
            command: command.to_string(),
        });

        let behavior = self.state.behavior_for(command);
        let (tx, rx) = mpsc::channel(64);

        let process = match behavior {
            ProcessBehavior::Exit {
                code,
                output,
                delay,
            } => {
                let (exit_tx, exit_rx) = oneshot::channel();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for line in output {
                        let _ = tx.send(line).await;
                    }
                    let _ = exit_tx.send(code);
                });
                SandboxProcess::new(rx, async move {
                    exit_rx
                        .await
                        .map_err(|_| Error::Sandbox("process vanished".to_string()))
                })
            }
            ProcessBehavior::Serve {
                output,
                ready,
                delay,
            } => {
                let ready_tx = self.ready_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for line in output {
                        let _ = tx.send(line).await;
                    }
                    if let Some(event) = ready {
                        let _ = ready_tx.send(event);
                    }
                });
                SandboxProcess::new(rx, std::future::pending())
            }
            ProcessBehavior::Hang { output } => {
                tokio::spawn(async move {
                    for line in output {
                        let _ = tx.send(line).await;
                    }
                    std::future::pending::<()>().await;
                });
                SandboxProcess::new(rx, std::future::pending())
            }
        };

        Ok(process)
    }

    async fn kill_processes(&self) -> Result<()> {
        self.ensure_alive()?;
        self.state.record(RuntimeEvent::KillProcesses(self.number));
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let failures = &self.state.teardown_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Teardown(format!("scripted teardown failure for {}", self.id)));
        }

        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            self.state.record(RuntimeEvent::Teardown(self.number));
        }
        Ok(())
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_exit_reports_code_and_output() {
        let runtime = MemoryRuntime::new();
        runtime.on_command(
            "npm install",
            ProcessBehavior::exit(1).with_output(&["npm ERR! 404"]),
        );
        let instance = runtime.boot().await.unwrap();

        let mut process = instance
            .spawn(&CommandSpec::new("npm", &["install"]))
            .await
            .unwrap();

        assert_eq!(process.output.recv().await.as_deref(), Some("npm ERR! 404"));
        assert_eq!(process.exit.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn serve_announces_ready_event() {
        let runtime = MemoryRuntime::new();
        let instance = runtime.boot().await.unwrap();
        let mut ready = instance.server_ready();

        let _process = instance
            .spawn(&CommandSpec::new("npm", &["run", "dev"]))
            .await
            .unwrap();

        let event = ready.recv().await.unwrap();
        assert_eq!(event.port, DEV_SERVER_PORT);
        assert_eq!(event.url, "http://localhost:5173");
    }

    #[tokio::test]
    async fn torn_down_instance_rejects_calls() {
        let runtime = MemoryRuntime::new();
        let instance = runtime.boot().await.unwrap();
        instance.teardown().await.unwrap();

        let err = instance
            .mount(&MaterializedFileSet::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
        assert_eq!(runtime.live_instances(), 0);
    }

    #[tokio::test]
    async fn unknown_commands_exit_cleanly() {
        let runtime = MemoryRuntime::new();
        let instance = runtime.boot().await.unwrap();

        let process = instance
            .spawn(&CommandSpec::new("true", &[]))
            .await
            .unwrap();

        assert_eq!(process.exit.await.unwrap(), 0);
        assert_eq!(runtime.spawned_commands(), vec!["true"]);
    }
}
