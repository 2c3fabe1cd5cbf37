//! Configuration for preview runs.
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields a working configuration. [`Validate`] catches settings that would
//! make every run fail before any sandbox is booted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// A command spawned inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command spec.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Longest accepted install or start timeout (one day).
pub const MAX_STEP_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Most output lines kept for failure diagnostics.
pub const MAX_DIAGNOSTIC_LINES: usize = 10_000;

/// Configuration for the install/start pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dependency install command.
    #[serde(default = "default_install_command")]
    pub install_command: CommandSpec,
    /// Dev server start command.
    #[serde(default = "default_start_command")]
    pub start_command: CommandSpec,
    /// Upper bound for the install step in seconds.
    #[serde(default = "default_step_timeout")]
    pub install_timeout_secs: u64,
    /// Upper bound for the server start step in seconds.
    #[serde(default = "default_step_timeout")]
    pub start_timeout_secs: u64,
    /// Text that must appear in server output before a ready event counts.
    ///
    /// `None` or an empty string trusts the runtime's ready event alone.
    #[serde(default = "default_ready_marker")]
    pub ready_marker: Option<String>,
    /// Number of trailing output lines kept for failure diagnostics.
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
}

fn default_install_command() -> CommandSpec {
    CommandSpec::new("npm", &["install"])
}

fn default_start_command() -> CommandSpec {
    CommandSpec::new("npm", &["run", "dev"])
}

fn default_step_timeout() -> u64 {
    60
}

fn default_ready_marker() -> Option<String> {
    Some("Network:".to_string())
}

fn default_diagnostic_lines() -> usize {
    20
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
            start_command: default_start_command(),
            install_timeout_secs: default_step_timeout(),
            start_timeout_secs: default_step_timeout(),
            ready_marker: default_ready_marker(),
            diagnostic_lines: default_diagnostic_lines(),
        }
    }
}

impl PipelineConfig {
    /// Returns the install timeout as a Duration, capped at one day.
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs.min(MAX_STEP_TIMEOUT_SECS))
    }

    /// Returns the start timeout as a Duration, capped at one day.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs.min(MAX_STEP_TIMEOUT_SECS))
    }

    /// Returns the diagnostic tail length, capped at [`MAX_DIAGNOSTIC_LINES`].
    pub fn diagnostic_lines(&self) -> usize {
        self.diagnostic_lines.min(MAX_DIAGNOSTIC_LINES)
    }

    /// Returns the ready marker, treating an empty string as unset.
    pub fn ready_marker(&self) -> Option<&str> {
        self.ready_marker.as_deref().filter(|m| !m.is_empty())
    }
}

/// Configuration for turning a project tree into mountable files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializerConfig {
    /// File extensions (with leading dot) that are mounted.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Path segments containing any of these are skipped.
    #[serde(default = "default_excluded_segments")]
    pub excluded_segments: Vec<String>,
    /// File names kept unprefixed at the mount root.
    #[serde(default = "default_root_config_files")]
    pub root_config_files: Vec<String>,
    /// Joins ancestor names into a flat key.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Prefix for keys of ordinary generated files.
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
}

fn default_allowed_extensions() -> Vec<String> {
    [".tsx", ".ts", ".jsx", ".js", ".css", ".html", ".json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_excluded_segments() -> Vec<String> {
    ["server", "api", "database"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_root_config_files() -> Vec<String> {
    ["postcss.config.js", "tailwind.config.js", "vite.config.js"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_delimiter() -> String {
    "_".to_string()
}

fn default_namespace_prefix() -> String {
    "src_".to_string()
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            excluded_segments: default_excluded_segments(),
            root_config_files: default_root_config_files(),
            delimiter: default_delimiter(),
            namespace_prefix: default_namespace_prefix(),
        }
    }
}

/// Top-level preview configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Quiet period after the last submission before a run starts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Tear down and reboot the sandbox on every run.
    #[serde(default = "default_reset_on_run")]
    pub reset_on_run: bool,
    /// Pipeline configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Materializer configuration.
    #[serde(default)]
    pub materializer: MaterializerConfig,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_reset_on_run() -> bool {
    true
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            reset_on_run: default_reset_on_run(),
            pipeline: PipelineConfig::default(),
            materializer: MaterializerConfig::default(),
        }
    }
}

impl PreviewConfig {
    /// Returns the debounce delay as a Duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        for warning in config.validate().into_result()? {
            tracing::warn!(path = ?path, warning = %warning, "config warning");
        }
        Ok(config)
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.install_command.program.trim().is_empty() {
            result.add_error("install_command.program cannot be empty");
        }
        if self.start_command.program.trim().is_empty() {
            result.add_error("start_command.program cannot be empty");
        }
        if self.install_timeout_secs == 0 {
            result.add_error("install_timeout_secs must be greater than zero");
        }
        if self.start_timeout_secs == 0 {
            result.add_error("start_timeout_secs must be greater than zero");
        }

        if self.ready_marker().is_none() {
            result.add_warning("no ready_marker set; trusting server-ready events alone");
        }

        for (field, secs) in [
            ("install_timeout_secs", self.install_timeout_secs),
            ("start_timeout_secs", self.start_timeout_secs),
        ] {
            if secs > MAX_STEP_TIMEOUT_SECS {
                result.add_error(format!(
                    "{} cannot exceed {} seconds",
                    field, MAX_STEP_TIMEOUT_SECS
                ));
            }
        }
        if self.diagnostic_lines > MAX_DIAGNOSTIC_LINES {
            result.add_error(format!(
                "diagnostic_lines cannot exceed {}",
                MAX_DIAGNOSTIC_LINES
            ));
        }

        if (601..=MAX_STEP_TIMEOUT_SECS).contains(&self.install_timeout_secs) {
            result.add_warning("install_timeout_secs over 10 minutes may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for MaterializerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.delimiter.is_empty() {
            result.add_error("delimiter cannot be empty");
        }
        if self.delimiter.contains('/') {
            result.add_error("delimiter cannot contain '/' since mount keys are flat");
        }
        for ext in &self.allowed_extensions {
            if !ext.starts_with('.') {
                result.add_error(format!("extension '{}' must start with '.'", ext));
            }
        }
        if self.allowed_extensions.is_empty() {
            result.add_warning("no allowed_extensions; only the scaffold will be mounted");
        }
        if self.excluded_segments.iter().any(|s| s.is_empty()) {
            result.add_error("excluded_segments cannot contain an empty string");
        }

        result
    }
}

impl Validate for PreviewConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.debounce_ms < 50 {
            result.add_warning("debounce_ms under 50ms will start a run for nearly every edit");
        }
        if !self.reset_on_run {
            result.add_warning("reset_on_run disabled; stale files from earlier runs may remain mounted");
        }

        result.merge(self.pipeline.validate());
        result.merge(self.materializer.validate());
        result
    }
}
