//! Executor configuration.
//!
//! Loaded from a JSON file (`--config`), or from the `PLAYGROUND_CONFIG`
//! environment variable as JSON. Every field has a default, so an empty
//! object is a valid configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::backend::validate_file_name;

/// Top-level configuration for the executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Which isolation backend runs submissions.
    #[serde(default)]
    pub backend: BackendType,

    /// Logical filename the submitted code is written to.
    #[serde(default = "default_entry_file")]
    pub entry_file: String,

    /// Command run inside the sandbox working directory.
    #[serde(default = "default_run_command")]
    pub run_command: Vec<String>,

    /// Wall-clock bound for the run stage, 0 disables it.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of sandbox instances allowed to be live at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long a request may wait for an admission permit.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_seconds: u64,

    /// Per-stream output ceiling in bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Largest accepted submission in bytes.
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,

    /// Extra environment variables for the run command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Available isolation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Private temporary directory on the host. No confinement.
    #[default]
    Local,
    /// One container per submission via the Docker engine API.
    Docker,
}

/// Settings for the host-directory backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// Parent directory for sandbox directories (system temp dir if unset).
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Path to the `record` wrapper. When set, runs report full resource usage.
    #[serde(default)]
    pub wrapper: Option<PathBuf>,
}

/// Settings for the container backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Wrapper command prefix inside the image.
    #[serde(default = "default_wrapper")]
    pub wrapper: Vec<String>,

    #[serde(default = "default_memory")]
    pub memory_mb: u64,

    #[serde(default = "default_true")]
    pub network_disabled: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            working_dir: default_working_dir(),
            wrapper: default_wrapper(),
            memory_mb: default_memory(),
            network_disabled: true,
        }
    }
}

/// Settings for the stale instance sweeper.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,

    /// Instances older than this are assumed leaked and reclaimed.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweep_interval(),
            stale_after_seconds: default_stale_after(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            entry_file: default_entry_file(),
            run_command: default_run_command(),
            timeout_seconds: default_timeout(),
            max_concurrent: default_max_concurrent(),
            queue_timeout_seconds: default_queue_timeout(),
            max_output_bytes: default_max_output_bytes(),
            max_code_bytes: default_max_code_bytes(),
            env: HashMap::new(),
            local: LocalConfig::default(),
            docker: DockerConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the `PLAYGROUND_CONFIG` environment variable,
    /// falling back to defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var("PLAYGROUND_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse PLAYGROUND_CONFIG"),
            Err(_) => {
                debug!("PLAYGROUND_CONFIG not set, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.run_command.is_empty(), "run_command must not be empty");
        anyhow::ensure!(self.max_concurrent > 0, "max_concurrent must be at least 1");
        anyhow::ensure!(
            self.sweep.interval_seconds > 0,
            "sweep.interval_seconds must be at least 1"
        );
        validate_file_name(&self.entry_file)
            .map_err(|e| anyhow::anyhow!("entry_file is not usable: {e}"))?;
        anyhow::ensure!(
            self.sweep.stale_after_seconds > self.timeout_seconds,
            "sweep.stale_after_seconds ({}) must exceed timeout_seconds ({})",
            self.sweep.stale_after_seconds,
            self.timeout_seconds
        );
        if self.backend == BackendType::Docker {
            anyhow::ensure!(
                self.docker.working_dir.starts_with('/'),
                "docker.working_dir must be absolute"
            );
        }
        Ok(())
    }

    /// Run-stage bound, `None` when disabled.
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_seconds))
        }
    }

    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_seconds)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.sweep.stale_after_seconds)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_seconds)
    }
}

fn default_entry_file() -> String {
    "main.go".into()
}

fn default_run_command() -> Vec<String> {
    vec!["go".into(), "run".into(), "main.go".into()]
}

fn default_image() -> String {
    "golang-playground".into()
}

fn default_working_dir() -> String {
    "/app".into()
}

fn default_wrapper() -> Vec<String> {
    vec!["record".into()]
}

const fn default_timeout() -> u64 {
    10
}

const fn default_max_concurrent() -> usize {
    4
}

const fn default_queue_timeout() -> u64 {
    30
}

const fn default_max_output_bytes() -> usize {
    1024 * 1024
}

const fn default_max_code_bytes() -> usize {
    256 * 1024
}

const fn default_memory() -> u64 {
    512
}

const fn default_true() -> bool {
    true
}

const fn default_sweep_interval() -> u64 {
    60
}

const fn default_stale_after() -> u64 {
    600
}
