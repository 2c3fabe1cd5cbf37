//! Error types for the preview orchestrator.

use thiserror::Error;

/// Top-level error type for preview operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The generated project tree is structurally invalid.
    #[error("invalid project tree: {0}")]
    GenerationInput(String),

    /// The sandbox runtime failed to boot an instance.
    #[error("failed to boot sandbox: {0}")]
    Boot(String),

    /// Tearing down the previous instance failed during a reset.
    #[error("failed to tear down sandbox: {0}")]
    Teardown(String),

    /// A mount or spawn call into the sandbox failed.
    ///
    /// The instance is considered unusable afterwards.
    #[error("sandbox operation failed: {0}")]
    Sandbox(String),

    /// Dependency install exited non-zero or timed out.
    #[error("Failed to install dependencies")]
    Install {
        /// Exit code, `None` when the install timed out.
        exit_code: Option<i32>,
        /// Tail of the captured install output.
        diagnostics: String,
    },

    /// The dev server never reported a reachable address.
    #[error("Server start timeout")]
    StartTimeout {
        /// Tail of the captured server output.
        diagnostics: String,
    },

    /// A newer run superseded this one.
    #[error("run superseded by a newer request")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Captured process output attached to this error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::Install { diagnostics, .. } | Error::StartTimeout { diagnostics } => {
                Some(diagnostics.as_str()).filter(|d| !d.is_empty())
            }
            _ => None,
        }
    }

    /// Returns true if this error only reports that the run was superseded.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if the sandbox instance should be dropped after this error.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Error::Sandbox(_) | Error::Io(_))
    }
}

/// Result type alias for preview operations.
pub type Result<T> = std::result::Result<T, Error>;
