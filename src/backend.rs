//! Isolation backend trait and implementations.
//!
//! A backend provisions one disposable sandbox instance per submission,
//! writes the submission into it, runs it, and tears it down. The
//! orchestrator drives these steps in order and never shares an instance
//! between requests.

pub mod archive;
mod docker;
mod local;

pub use docker::DockerBackend;
pub use local::LocalBackend;

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::info;

use crate::config::{BackendType, Config};
use crate::error::ExecutionError;
use crate::record::ExecutionRecord;

/// Which kind of isolation an instance provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationKind {
    /// Host temporary directory. Provides no confinement at all: the
    /// submission can reach the whole host filesystem.
    Local,
    /// Container created through a container runtime.
    Containerized,
}

/// Lifecycle of a sandbox instance. Transitions only move forward, except
/// that `Destroyed` can be reached from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SandboxState {
    Created,
    Provisioned,
    Populated,
    Running,
    Completed,
    Failed,
    Destroyed,
}

impl SandboxState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        use SandboxState::{Completed, Created, Destroyed, Failed, Populated, Provisioned, Running};
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed)
            | (Created, Provisioned)
            | (Provisioned, Populated)
            | (Populated, Running)
            | (Running, Completed)
            | (Created | Provisioned | Populated | Running, Failed) => true,
            _ => false,
        }
    }
}

/// Opaque handle a backend uses to find its instance again.
#[derive(Debug)]
pub enum SandboxHandle {
    /// Private host directory. `None` once removed.
    Directory(Option<TempDir>),
    /// Runtime-assigned container identifier.
    Container(String),
}

/// One isolated environment, exclusively owned by one in-flight submission.
#[derive(Debug)]
pub struct SandboxInstance {
    /// Short id used in logs.
    pub id: String,
    pub kind: IsolationKind,
    pub handle: SandboxHandle,
    /// Working directory of the run command (host path for local
    /// instances, container path for containerized ones).
    pub working_dir: String,
    state: SandboxState,
}

impl SandboxInstance {
    pub fn new(id: String, kind: IsolationKind, handle: SandboxHandle, working_dir: String) -> Self {
        Self {
            id,
            kind,
            handle,
            working_dir,
            state: SandboxState::Created,
        }
    }

    pub const fn state(&self) -> SandboxState {
        self.state
    }

    /// Move to `next`. Illegal transitions leave the state untouched and
    /// return `false`.
    pub fn advance(&mut self, next: SandboxState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                instance = %self.id,
                from = ?self.state,
                to = ?next,
                "Ignoring illegal sandbox state transition"
            );
            false
        }
    }

    /// Mark the instance failed unless it already reached a terminal state.
    pub fn fail(&mut self) {
        if self.state.can_advance_to(SandboxState::Failed) {
            self.state = SandboxState::Failed;
        }
    }

    pub const fn is_destroyed(&self) -> bool {
        matches!(self.state, SandboxState::Destroyed)
    }
}

/// A file to place in the sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// What to run inside a populated instance.
///
/// The command runs in [`SandboxInstance::working_dir`]. Containerized
/// backends bake the command, environment and output ceiling into the
/// container at provisioning time and reject a spec that differs; only
/// `timeout` varies per run there.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// Per-stream output ceiling applied while capturing.
    pub max_output_bytes: usize,
}

/// Trait for isolation backends.
///
/// One handle is shared by every concurrent execution, so implementations
/// must be safe for concurrent use. Instances themselves are never shared.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Create a fresh instance in the `Provisioned` state.
    async fn provision(&self) -> Result<SandboxInstance, ExecutionError>;

    /// Place `files` in the instance working directory.
    ///
    /// Filenames must pass [`validate_file_name`] before any path or archive
    /// entry is built.
    async fn inject(
        &self,
        instance: &mut SandboxInstance,
        files: &[SourceFile],
    ) -> Result<(), ExecutionError>;

    /// Run the command and capture its execution record.
    async fn run(
        &self,
        instance: &mut SandboxInstance,
        spec: &ExecutionSpec,
    ) -> Result<ExecutionRecord, ExecutionError>;

    /// Tear the instance down. Idempotent and infallible: failures are
    /// logged and left to [`IsolationBackend::sweep_stale`].
    async fn destroy(&self, instance: &mut SandboxInstance);

    /// Reclaim instances older than `max_age` that were never destroyed.
    /// Returns how many were removed.
    async fn sweep_stale(&self, max_age: Duration) -> anyhow::Result<usize>;
}

/// Build the backend selected by `config`.
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn IsolationBackend>> {
    match config.backend {
        BackendType::Local => {
            let backend = LocalBackend::from_config(&config.local);
            info!(wrapper = ?config.local.wrapper, "Using local backend");
            Ok(Arc::new(backend))
        }
        BackendType::Docker => {
            let backend = DockerBackend::connect(
                config.docker.clone(),
                config.run_command.clone(),
                config.env.clone(),
                config.max_output_bytes,
            )?;
            info!(image = %config.docker.image, "Using docker backend");
            Ok(Arc::new(backend))
        }
    }
}

/// Check that `name` is a plain relative path that stays inside the
/// sandbox working directory.
pub fn validate_file_name(name: &str) -> Result<(), ExecutionError> {
    if name.is_empty() {
        return Err(ExecutionError::Injection("empty file name".into()));
    }
    if name.contains('\0') {
        return Err(ExecutionError::Injection(format!(
            "file name {name:?} contains a NUL byte"
        )));
    }
    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ExecutionError::Injection(format!(
                    "file name {name:?} contains a parent directory segment"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExecutionError::Injection(format!(
                    "file name {name:?} is not relative"
                )));
            }
        }
    }
    if !path.components().any(|c| matches!(c, Component::Normal(_))) {
        return Err(ExecutionError::Injection(format!(
            "file name {name:?} does not name a file"
        )));
    }
    Ok(())
}
