//! Sandbox session management.
//!
//! [`SessionManager`] owns the single live sandbox instance. Every lifecycle
//! operation goes through one fair async mutex, so boot, reset and teardown
//! run strictly one at a time in arrival order. A failed operation releases
//! the queue like any other. Callers that queued while a boot was underway
//! share that boot's outcome, failure included; later callers retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::runtime::{SandboxInstance, SandboxRuntime};

struct Slot<I> {
    instance: Option<Arc<I>>,
    /// Number of boots started so far.
    attempts: u64,
    /// Attempt number and reason of the most recent failed boot.
    failed_boot: Option<(u64, String)>,
}

/// Owns at most one booted instance of a runtime.
pub struct SessionManager<R: SandboxRuntime> {
    runtime: R,
    /// The operation queue and the state it guards.
    slot: Mutex<Slot<R::Instance>>,
    /// Attempt number of the boot in progress, 0 when none is.
    booting: AtomicU64,
}

impl<R: SandboxRuntime> SessionManager<R> {
    /// Creates a session with no instance booted yet.
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            slot: Mutex::new(Slot {
                instance: None,
                attempts: 0,
                failed_boot: None,
            }),
            booting: AtomicU64::new(0),
        }
    }

    /// Returns the underlying runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Returns a ready instance, booting one if needed.
    ///
    /// With `reset`, an existing instance is torn down first. Callers queued
    /// behind an in-flight boot receive the instance it produced, or its
    /// boot error; a reset always boots afresh.
    pub async fn acquire(&self, reset: bool) -> Result<Arc<R::Instance>> {
        let joined = self.booting.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;

        if reset {
            slot.failed_boot = None;
            if let Some(instance) = slot.instance.take() {
                tracing::info!(instance = %instance.id(), "resetting sandbox");
                instance.teardown().await.map_err(|e| match e {
                    Error::Teardown(_) => e,
                    other => Error::Teardown(other.to_string()),
                })?;
            }
        }

        if joined != 0 {
            if let Some((attempt, reason)) = &slot.failed_boot {
                if *attempt == joined {
                    return Err(Error::Boot(reason.clone()));
                }
            }
        }

        if let Some(instance) = slot.instance.as_ref() {
            return Ok(Arc::clone(instance));
        }

        slot.attempts += 1;
        let attempt = slot.attempts;
        self.booting.store(attempt, Ordering::SeqCst);
        tracing::info!(runtime = %self.runtime.name(), attempt, "booting sandbox");
        let booted = self.runtime.boot().await;
        self.booting.store(0, Ordering::SeqCst);

        match booted {
            Ok(instance) => {
                let instance = Arc::new(instance);
                tracing::info!(instance = %instance.id(), "sandbox ready");
                slot.failed_boot = None;
                slot.instance = Some(Arc::clone(&instance));
                Ok(instance)
            }
            Err(e) => {
                tracing::warn!(runtime = %self.runtime.name(), attempt, error = %e, "sandbox boot failed");
                let reason = match e {
                    Error::Boot(reason) => reason,
                    other => other.to_string(),
                };
                slot.failed_boot = Some((attempt, reason.clone()));
                Err(Error::Boot(reason))
            }
        }
    }

    /// Forgets the held instance without tearing it down.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(instance) = slot.instance.take() {
            tracing::warn!(instance = %instance.id(), "sandbox invalidated");
        }
    }

    /// Tears down the held instance, if any.
    pub async fn teardown(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        match slot.instance.take() {
            Some(instance) => {
                tracing::info!(instance = %instance.id(), "tearing down sandbox");
                instance.teardown().await
            }
            None => Ok(()),
        }
    }

    /// Returns the held instance without booting.
    pub async fn current(&self) -> Option<Arc<R::Instance>> {
        self.slot.lock().await.instance.clone()
    }

    /// Returns true if an instance is booted.
    pub async fn is_ready(&self) -> bool {
        self.slot.lock().await.instance.is_some()
    }
}
