//! Host directory backend.
//!
//! Each instance is a private temporary directory that doubles as the
//! working directory of the run command. There is no confinement: the
//! submission runs as the executor's user and can reach the whole host
//! filesystem. Do not point this at untrusted code without a stronger
//! backend in front of it.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use super::{
    validate_file_name, ExecutionSpec, IsolationBackend, IsolationKind, SandboxHandle,
    SandboxInstance, SandboxState, SourceFile,
};
use crate::capture::Capture;
use crate::config::LocalConfig;
use crate::error::{ExecutionError, PartialOutput};
use crate::record::{self, ExecutionRecord, ResourceUsage, Termination, OUTPUT_LIMIT_ENV};

/// Name prefix of every sandbox directory, used by the sweeper.
const DIR_PREFIX: &str = "playground-sandbox";

/// Backend that runs submissions in a host temporary directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    wrapper: Option<PathBuf>,
}

impl LocalBackend {
    /// Create a backend placing sandboxes under `root`. When `wrapper` is
    /// set, runs go through the `record` wrapper and report full usage.
    pub fn new(root: PathBuf, wrapper: Option<PathBuf>) -> Self {
        Self { root, wrapper }
    }

    pub fn from_config(config: &LocalConfig) -> Self {
        Self::new(
            config.root.clone().unwrap_or_else(std::env::temp_dir),
            config.wrapper.clone(),
        )
    }

    fn directory(instance: &SandboxInstance) -> Option<&Path> {
        match &instance.handle {
            SandboxHandle::Directory(Some(dir)) => Some(dir.path()),
            _ => None,
        }
    }

    fn command(&self, spec: &ExecutionSpec, dir: &Path) -> Command {
        let mut cmd = match &self.wrapper {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.args(&spec.command);
                cmd.env(OUTPUT_LIMIT_ENV, spec.max_output_bytes.to_string());
                cmd
            }
            None => {
                let mut cmd = Command::new(&spec.command[0]);
                cmd.args(&spec.command[1..]);
                cmd
            }
        };
        cmd.current_dir(dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }
}

#[async_trait]
impl IsolationBackend for LocalBackend {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn provision(&self) -> Result<SandboxInstance, ExecutionError> {
        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| {
                ExecutionError::Provisioning(format!(
                    "cannot create sandbox directory in {}: {e}",
                    self.root.display()
                ))
            })?;

        let id = dir
            .path()
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
        let working_dir = dir.path().to_string_lossy().into_owned();

        let mut instance = SandboxInstance::new(
            id,
            IsolationKind::Local,
            SandboxHandle::Directory(Some(dir)),
            working_dir,
        );
        instance.advance(SandboxState::Provisioned);
        debug!(instance = %instance.id, "Provisioned local sandbox");
        Ok(instance)
    }

    #[instrument(skip(self, instance, files), fields(instance = %instance.id))]
    async fn inject(
        &self,
        instance: &mut SandboxInstance,
        files: &[SourceFile],
    ) -> Result<(), ExecutionError> {
        let result = async {
            let dir = Self::directory(instance)
                .ok_or_else(|| ExecutionError::Injection("sandbox directory is gone".into()))?
                .to_path_buf();
            if instance.state() != SandboxState::Provisioned {
                return Err(ExecutionError::Injection(format!(
                    "instance is {:?}, not provisioned",
                    instance.state()
                )));
            }
            for file in files {
                validate_file_name(&file.name)?;
            }
            for file in files {
                let path = dir.join(&file.name);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        ExecutionError::Injection(format!("create {}: {e}", parent.display()))
                    })?;
                }
                tokio::fs::write(&path, file.content.as_bytes())
                    .await
                    .map_err(|e| ExecutionError::Injection(format!("write {}: {e}", file.name)))?;
                debug!(file = %file.name, bytes = file.content.len(), "Wrote source file");
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                instance.advance(SandboxState::Populated);
                Ok(())
            }
            Err(e) => {
                instance.fail();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, instance, spec), fields(instance = %instance.id, command = ?spec.command))]
    async fn run(
        &self,
        instance: &mut SandboxInstance,
        spec: &ExecutionSpec,
    ) -> Result<ExecutionRecord, ExecutionError> {
        if instance.state() != SandboxState::Populated {
            instance.fail();
            return Err(ExecutionError::Start(format!(
                "instance is {:?}, not populated",
                instance.state()
            )));
        }
        if spec.command.is_empty() {
            instance.fail();
            return Err(ExecutionError::Start("empty command".into()));
        }
        let Some(dir) = Self::directory(instance).map(Path::to_path_buf) else {
            instance.fail();
            return Err(ExecutionError::Start("sandbox directory is gone".into()));
        };

        let capture_limit = if self.wrapper.is_some() {
            record::wrapper_output_ceiling(spec.max_output_bytes)
        } else {
            spec.max_output_bytes
        };

        let started = Instant::now();
        let mut child = match self.command(spec, &dir).spawn() {
            Ok(child) => child,
            Err(e) => {
                instance.fail();
                return Err(ExecutionError::Start(format!(
                    "cannot spawn {}: {e}",
                    spec.command[0]
                )));
            }
        };
        instance.advance(SandboxState::Running);
        // Declared after `child` so a dropped run kills the group before
        // `kill_on_drop` reaps the leader.
        let mut group = ProcessGroup::of(&child);

        let (Some(child_stdout), Some(child_stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            group.kill();
            let _ = child.kill().await;
            instance.fail();
            return Err(ExecutionError::Start("child pipes unavailable".into()));
        };

        // Drain both pipes to EOF concurrently, then reap. Buffers live outside
        // the future so whatever was read survives a timeout.
        let mut stdout = Capture::new(capture_limit);
        let mut stderr = Capture::new(capture_limit);
        let run = async {
            let (r1, r2) = tokio::join!(stdout.drain(child_stdout), stderr.drain(child_stderr));
            r1?;
            r2?;
            // Background processes that closed their streams share the
            // group. The leader is not reaped yet, so the pgid is still ours.
            group.kill();
            child.wait().await
        };

        let outcome = match spec.timeout {
            Some(bound) => tokio::time::timeout(bound, run).await.map_err(|_| bound),
            None => Ok(run.await),
        };

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                group.kill();
                let _ = child.kill().await;
                instance.fail();
                return Err(ExecutionError::Wait {
                    message: e.to_string(),
                    partial: PartialOutput::new(stdout.bytes, stderr.bytes),
                });
            }
            Err(bound) => {
                group.kill();
                let _ = child.kill().await;
                instance.fail();
                warn!(?bound, "Run timed out, process group killed");
                return Err(ExecutionError::Timeout {
                    after: bound,
                    partial: PartialOutput::new(stdout.bytes, stderr.bytes),
                });
            }
        };
        let wall_time = started.elapsed();

        let record = if self.wrapper.is_some() {
            match record::parse_wrapper_output(&stdout.bytes, &stderr.bytes) {
                Ok(record) => record,
                Err(e) => {
                    instance.fail();
                    return Err(e);
                }
            }
        } else {
            ExecutionRecord {
                termination: termination(status),
                stdout: stdout.bytes,
                stderr: stderr.bytes,
                wall_time,
                usage: ResourceUsage::default(),
                truncated: stdout.truncated || stderr.truncated,
            }
        };

        instance.advance(SandboxState::Completed);
        debug!(
            exit_code = record.termination.exit_code(),
            ?wall_time,
            "Execution completed"
        );
        Ok(record)
    }

    #[instrument(skip(self, instance), fields(instance = %instance.id))]
    async fn destroy(&self, instance: &mut SandboxInstance) {
        if instance.is_destroyed() {
            return;
        }
        if let SandboxHandle::Directory(dir) = &mut instance.handle {
            if let Some(dir) = dir.take() {
                let path = dir.path().to_path_buf();
                match tokio::task::spawn_blocking(move || dir.close()).await {
                    Ok(Ok(())) => debug!(path = %path.display(), "Removed sandbox directory"),
                    Ok(Err(e)) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove sandbox directory");
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Sandbox removal task failed"),
                }
            }
        }
        instance.advance(SandboxState::Destroyed);
    }

    async fn sweep_stale(&self, max_age: Duration) -> anyhow::Result<usize> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || sweep_directories(&root, max_age)).await?
    }
}

/// Remove sandbox directories under `root` last modified at least `max_age` ago.
fn sweep_directories(root: &Path, max_age: Duration) -> anyhow::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Error reading sandbox root entry");
                continue;
            }
        };
        if !entry.file_name().to_string_lossy().starts_with(DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(path = %path.display(), ?age, "Reclaimed stale sandbox directory");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to reclaim sandbox directory"),
        }
    }
    Ok(removed)
}

fn termination(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        Termination::Exited(code)
    } else if let Some(signal) = status.signal() {
        Termination::Signaled(signal)
    } else {
        Termination::Unknown
    }
}

/// The process group of a spawned submission. Killed with SIGKILL at most
/// once: explicitly, or on drop when the run future is cancelled.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(
            child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        )
    }

    fn kill(&mut self) {
        let Some(pgid) = self.0.take() else {
            return;
        };
        // ESRCH just means the group is already gone
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            debug!(%pgid, error = %e, "killpg");
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
