//! Container backend on top of the Docker engine API.
//!
//! Every submission gets its own container from a fixed image. The
//! container's command is the `record` wrapper followed by the run command;
//! the wrapper prints a structured execution record on its stdout, which is
//! fetched from the container logs once the container stops.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use super::{
    archive, ExecutionSpec, IsolationBackend, IsolationKind, SandboxHandle, SandboxInstance,
    SandboxState, SourceFile,
};
use crate::config::DockerConfig;
use crate::error::{ExecutionError, PartialOutput};
use crate::record::{self, ExecutionRecord, OUTPUT_LIMIT_ENV};

/// Label put on every container this backend creates.
const MANAGED_LABEL: &str = "playground.managed";

/// Backend that runs each submission in a fresh container.
///
/// The `Docker` client is cheap to clone and safe to share between
/// concurrent executions.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
    /// Run command and environment baked into every container at creation.
    command: Vec<String>,
    env: HashMap<String, String>,
    max_output_bytes: usize,
}

impl DockerBackend {
    /// Connect to the local Docker daemon (socket or `DOCKER_HOST`).
    ///
    /// The container command is fixed at provisioning time, so the run
    /// command and its environment are given here rather than per run.
    pub fn connect(
        config: DockerConfig,
        command: Vec<String>,
        env: HashMap<String, String>,
        max_output_bytes: usize,
    ) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker daemon: {e}"))?;
        Ok(Self {
            docker,
            config,
            command,
            env,
            max_output_bytes,
        })
    }

    /// A container runs the command it was created with, so a spec asking
    /// for anything else cannot be honoured.
    fn check_spec(&self, spec: &ExecutionSpec) -> Result<(), String> {
        if spec.command != self.command {
            return Err(format!(
                "container runs {:?}, spec asks for {:?}",
                self.command, spec.command
            ));
        }
        if spec.env != self.env {
            return Err("spec environment differs from the container environment".into());
        }
        if spec.max_output_bytes != self.max_output_bytes {
            return Err(format!(
                "container output ceiling is {}, spec asks for {}",
                self.max_output_bytes, spec.max_output_bytes
            ));
        }
        Ok(())
    }

    fn container_config(&self) -> Config<String> {
        let cmd: Vec<String> = self
            .config
            .wrapper
            .iter()
            .chain(self.command.iter())
            .cloned()
            .collect();
        let mut env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push(format!("{OUTPUT_LIMIT_ENV}={}", self.max_output_bytes));

        let memory = i64::try_from(self.config.memory_mb)
            .unwrap_or(i64::MAX / (1024 * 1024))
            .saturating_mul(1024 * 1024);

        Config {
            image: Some(self.config.image.clone()),
            working_dir: Some(self.config.working_dir.clone()),
            cmd: Some(cmd),
            env: Some(env),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(self.config.network_disabled),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_id(instance: &SandboxInstance) -> Result<String, String> {
        match &instance.handle {
            SandboxHandle::Container(id) => Ok(id.clone()),
            SandboxHandle::Directory(_) => Err("instance is not a container".into()),
        }
    }

    /// Collect the container's stdout and stderr once. On failure the output
    /// gathered so far is returned with the error.
    async fn fetch_logs(&self, id: &str) -> Result<PartialOutput, (String, PartialOutput)> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut output = PartialOutput::default();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(item) = stream.next().await {
            match item {
                Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                    output.stdout.extend_from_slice(&message);
                }
                Ok(LogOutput::StdErr { message }) => output.stderr.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => return Err((e.to_string(), output)),
            }
        }
        Ok(output)
    }

    /// Block until the container leaves the running state.
    async fn wait_not_running(&self, id: &str) -> Result<(), String> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => {
                debug!(status_code = response.status_code, "Container stopped");
                Ok(())
            }
            // The engine reports a non-zero exit of the wrapper as an error
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                debug!(status_code = code, "Container stopped");
                Ok(())
            }
            Some(Err(e)) => Err(e.to_string()),
            None => Err("wait stream ended without a status".into()),
        }
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    #[instrument(skip(self), fields(image = %self.config.image))]
    async fn provision(&self) -> Result<SandboxInstance, ExecutionError> {
        let name = format!("playground-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), self.container_config())
            .await
            .map_err(|e| ExecutionError::Provisioning(format!("create container: {e}")))?;

        for warning in &created.warnings {
            warn!(container = %name, %warning, "Docker warning on create");
        }

        let mut instance = SandboxInstance::new(
            name,
            IsolationKind::Containerized,
            SandboxHandle::Container(created.id),
            self.config.working_dir.clone(),
        );
        instance.advance(SandboxState::Provisioned);
        debug!(instance = %instance.id, "Provisioned container");
        Ok(instance)
    }

    #[instrument(skip(self, instance, files), fields(instance = %instance.id))]
    async fn inject(
        &self,
        instance: &mut SandboxInstance,
        files: &[SourceFile],
    ) -> Result<(), ExecutionError> {
        let result = async {
            if instance.state() != SandboxState::Provisioned {
                return Err(ExecutionError::Injection(format!(
                    "instance is {:?}, not provisioned",
                    instance.state()
                )));
            }
            let id = Self::container_id(instance).map_err(ExecutionError::Injection)?;
            let tar = archive::build(files)?;
            let options = UploadToContainerOptions {
                path: instance.working_dir.clone(),
                ..Default::default()
            };
            self.docker
                .upload_to_container(&id, Some(options), tar.into())
                .await
                .map_err(|e| ExecutionError::Injection(format!("copy to container: {e}")))
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

    #[instrument(skip(self, instance, spec), fields(instance = %instance.id))]
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
        let id = match self
            .check_spec(spec)
            .and_then(|()| Self::container_id(instance))
        {
            Ok(id) => id,
            Err(e) => {
                instance.fail();
                return Err(ExecutionError::Start(e));
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            instance.fail();
            return Err(ExecutionError::Start(format!("container start: {e}")));
        }
        instance.advance(SandboxState::Running);

        let waited = match spec.timeout {
            Some(bound) => tokio::time::timeout(bound, self.wait_not_running(&id))
                .await
                .map_err(|_| bound),
            None => Ok(self.wait_not_running(&id).await),
        };

        match waited {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                instance.fail();
                let partial = self.fetch_logs(&id).await.unwrap_or_else(|(_, partial)| partial);
                return Err(ExecutionError::Wait { message, partial });
            }
            Err(bound) => {
                if let Err(e) = self
                    .docker
                    .kill_container(&id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed out container");
                }
                instance.fail();
                warn!(?bound, "Run timed out, container killed");
                // The wrapper never printed a record, so its logs hold nothing useful
                return Err(ExecutionError::Timeout {
                    after: bound,
                    partial: PartialOutput::default(),
                });
            }
        }

        let logs = match self.fetch_logs(&id).await {
            Ok(logs) => logs,
            Err((message, partial)) => {
                instance.fail();
                return Err(ExecutionError::Wait {
                    message: format!("container logs: {message}"),
                    partial,
                });
            }
        };

        match record::parse_wrapper_output(&logs.stdout, &logs.stderr) {
            Ok(record) => {
                instance.advance(SandboxState::Completed);
                debug!(
                    exit_code = record.termination.exit_code(),
                    wall_time = ?record.wall_time,
                    "Execution completed"
                );
                Ok(record)
            }
            Err(e) => {
                instance.fail();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, instance), fields(instance = %instance.id))]
    async fn destroy(&self, instance: &mut SandboxInstance) {
        if instance.is_destroyed() {
            return;
        }
        if let Ok(id) = Self::container_id(instance) {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(&id, Some(options)).await {
                Ok(()) => debug!("Removed container"),
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => debug!("Container already gone"),
                Err(e) => {
                    warn!(error = %e, "Failed to remove container, leaving it to the sweeper");
                }
            }
        }
        instance.advance(SandboxState::Destroyed);
    }

    async fn sweep_stale(&self, max_age: Duration) -> anyhow::Result<usize> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{MANAGED_LABEL}=true")],
            )]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        let cutoff = now.saturating_sub(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX));

        let mut removed = 0;
        for container in containers {
            let (Some(id), Some(created)) = (container.id, container.created) else {
                continue;
            };
            if created > cutoff {
                continue;
            }
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(&id, Some(options)).await {
                Ok(()) => {
                    debug!(container = %id, created, "Reclaimed stale container");
                    removed += 1;
                }
                Err(e) => warn!(container = %id, error = %e, "Failed to reclaim container"),
            }
        }
        Ok(removed)
    }
}
