//! Execution pipeline.
//!
//! Drives one submission through admission, provisioning, injection, run,
//! normalization and teardown. Every instance that is provisioned is
//! destroyed again, whichever stage fails and even when the caller drops
//! the future halfway through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionSpec, IsolationBackend, SandboxInstance, SourceFile};
use crate::config::Config;
use crate::error::{ExecutionError, PartialOutput, RequestError};
use crate::record::{self, ExecutionRecord, ExecutionResult};

/// Slack given to a backend past the run timeout before the pipeline stops
/// waiting for it.
const RUN_GRACE: Duration = Duration::from_secs(5);

/// Request document accepted by [`Orchestrator::execute_request`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub code: String,
}

impl ExecuteRequest {
    /// Decode and check a request body.
    pub fn from_json(body: &[u8], max_code_bytes: usize) -> Result<Self, RequestError> {
        let request: Self = serde_json::from_slice(body)?;
        request.check_size(max_code_bytes)?;
        Ok(request)
    }

    fn check_size(&self, limit: usize) -> Result<(), RequestError> {
        if self.code.len() > limit {
            return Err(RequestError::TooLarge {
                size: self.code.len(),
                limit,
            });
        }
        Ok(())
    }
}

/// Runs submissions against one shared backend.
///
/// Cheap to clone; clones share the backend and the admission permits.
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn IsolationBackend>,
    config: Arc<Config>,
    permits: Arc<Semaphore>,
    run_grace: Duration,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn IsolationBackend>, config: Config) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            backend,
            config: Arc::new(config),
            permits,
            run_grace: RUN_GRACE,
        }
    }

    /// Override the slack past the run timeout.
    #[must_use]
    pub const fn with_run_grace(mut self, grace: Duration) -> Self {
        self.run_grace = grace;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of admission permits in use. A permit is held from before
    /// provisioning until teardown finished, so this bounds the number of
    /// live sandbox instances.
    pub fn live_instances(&self) -> usize {
        self.config.max_concurrent - self.permits.available_permits()
    }

    /// Decode a request body and execute it. Malformed requests never reach
    /// a backend.
    pub async fn execute_request(&self, body: &[u8]) -> ExecutionResult {
        match ExecuteRequest::from_json(body, self.config.max_code_bytes) {
            Ok(request) => self.execute(&request.code).await,
            Err(e) => {
                warn!(error = %e, "Rejecting request");
                ExecutionResult::rejected(e.status())
            }
        }
    }

    /// Execute `code` as the configured entry file.
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        let request = ExecuteRequest {
            code: code.to_string(),
        };
        if let Err(e) = request.check_size(self.config.max_code_bytes) {
            warn!(error = %e, "Rejecting request");
            return ExecutionResult::rejected(e.status());
        }

        let files = [SourceFile::new(self.config.entry_file.clone(), request.code)];
        self.execute_files(&files).await
    }

    /// Execute a submission made of several files. The run command decides
    /// which of them is the entry point.
    pub async fn execute_files(&self, files: &[SourceFile]) -> ExecutionResult {
        let started = Instant::now();
        let max_output = self.config.max_output_bytes;

        match self.pipeline(files).await {
            Ok(record) => {
                let result = record::normalize(&record, max_output);
                info!(
                    status = %result.status,
                    exit_code = result.exit_code,
                    real_time_ns = result.real_time,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Execution finished"
                );
                result
            }
            Err(e) => {
                error!(
                    status = e.status(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Execution failed"
                );
                ExecutionResult::failure(&e, max_output)
            }
        }
    }

    async fn pipeline(&self, files: &[SourceFile]) -> Result<ExecutionRecord, ExecutionError> {
        let permit = self.admit().await?;
        let instance = self.backend.provision().await?;
        debug!(instance = %instance.id, "Provisioned sandbox");

        let mut guard = InstanceGuard {
            backend: Arc::clone(&self.backend),
            instance: Some(instance),
            permit: Some(permit),
        };
        let outcome = match guard.instance.as_mut() {
            Some(instance) => self.populate_and_run(instance, files).await,
            None => Err(ExecutionError::Provisioning("sandbox instance missing".into())),
        };
        guard.release().await;
        outcome
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, ExecutionError> {
        let waited = self.config.queue_timeout();
        match tokio::time::timeout(waited, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed; treat it like a full queue.
            Ok(Err(_)) | Err(_) => Err(ExecutionError::Overloaded { waited }),
        }
    }

    async fn populate_and_run(
        &self,
        instance: &mut SandboxInstance,
        files: &[SourceFile],
    ) -> Result<ExecutionRecord, ExecutionError> {
        self.backend.inject(instance, files).await?;

        let spec = ExecutionSpec {
            command: self.config.run_command.clone(),
            env: self.config.env.clone(),
            timeout: self.config.timeout(),
            max_output_bytes: self.config.max_output_bytes,
        };

        let Some(bound) = spec.timeout else {
            return self.backend.run(instance, &spec).await;
        };

        let deadline = bound + self.run_grace;
        let outcome = tokio::time::timeout(deadline, self.backend.run(instance, &spec)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(instance = %instance.id, "Backend ignored the run timeout");
                instance.fail();
                Err(ExecutionError::Timeout {
                    after: bound,
                    partial: PartialOutput::default(),
                })
            }
        }
    }

    /// Periodically reclaim instances that outlived the stale threshold.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let interval = self.config.sweep_interval();
        let max_age = self.config.stale_after();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Sweeper pass");
                match backend.sweep_stale(max_age).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Reclaimed stale sandboxes"),
                    Err(e) => warn!(error = %e, "Sweep failed"),
                }
            }
        })
    }
}

/// Owns a provisioned instance and its admission permit.
///
/// [`InstanceGuard::release`] destroys the instance on the normal path. If
/// the guard is dropped first (the request future was cancelled), teardown
/// is handed to a background task and the permit is returned after it.
struct InstanceGuard {
    backend: Arc<dyn IsolationBackend>,
    instance: Option<SandboxInstance>,
    permit: Option<OwnedSemaphorePermit>,
}

impl InstanceGuard {
    async fn release(mut self) {
        if let Some(mut instance) = self.instance.take() {
            self.backend.destroy(&mut instance).await;
            debug!(instance = %instance.id, "Destroyed sandbox");
        }
        drop(self.permit.take());
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let Some(mut instance) = self.instance.take() else {
            return;
        };
        if instance.is_destroyed() {
            return;
        }

        let backend = Arc::clone(&self.backend);
        let permit = self.permit.take();
        warn!(instance = %instance.id, "Execution abandoned, destroying sandbox");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    backend.destroy(&mut instance).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(instance = %instance.id, "No runtime for teardown, leaving it to the sweeper");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IsolationKind, LocalBackend, SandboxHandle, SandboxState};
    use crate::record::{ResourceUsage, Termination};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        Provision,
        Inject,
        Start,
        Timeout,
        Wait,
        Parse,
        Hang,
    }

    /// Backend that echoes the submitted code back as stdout.
    #[derive(Default)]
    struct FakeBackend {
        fault: Option<Fault>,
        run_delay: Duration,
        next_id: AtomicUsize,
        live: AtomicUsize,
        peak: AtomicUsize,
        provisioned: AtomicUsize,
        files: Mutex<HashMap<String, String>>,
        ids: Mutex<HashSet<String>>,
    }

    impl FakeBackend {
        fn failing(fault: Fault) -> Self {
            Self {
                fault: Some(fault),
                ..Self::default()
            }
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IsolationBackend for FakeBackend {
        async fn provision(&self) -> Result<SandboxInstance, ExecutionError> {
            if self.fault == Some(Fault::Provision) {
                return Err(ExecutionError::Provisioning("no capacity".into()));
            }
            let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            self.ids.lock().unwrap().insert(id.clone());

            let mut instance = SandboxInstance::new(
                id.clone(),
                IsolationKind::Containerized,
                SandboxHandle::Container(id),
                "/app".into(),
            );
            instance.advance(SandboxState::Provisioned);
            Ok(instance)
        }

        async fn inject(
            &self,
            instance: &mut SandboxInstance,
            files: &[SourceFile],
        ) -> Result<(), ExecutionError> {
            if self.fault == Some(Fault::Inject) {
                instance.fail();
                return Err(ExecutionError::Injection("disk full".into()));
            }
            let code = files.iter().map(|f| f.content.as_str()).collect::<String>();
            self.files.lock().unwrap().insert(instance.id.clone(), code);
            instance.advance(SandboxState::Populated);
            Ok(())
        }

        async fn run(
            &self,
            instance: &mut SandboxInstance,
            spec: &ExecutionSpec,
        ) -> Result<ExecutionRecord, ExecutionError> {
            assert_eq!(instance.state(), SandboxState::Populated);
            instance.advance(SandboxState::Running);
            let partial = || PartialOutput::new("half", "");
            match self.fault {
                Some(Fault::Start) => return Err(ExecutionError::Start("no such file".into())),
                Some(Fault::Timeout) => {
                    return Err(ExecutionError::Timeout {
                        after: spec.timeout.unwrap_or_default(),
                        partial: partial(),
                    })
                }
                Some(Fault::Wait) => {
                    return Err(ExecutionError::Wait {
                        message: "lost child".into(),
                        partial: partial(),
                    })
                }
                Some(Fault::Parse) => {
                    return Err(ExecutionError::RecordParse {
                        message: "garbage".into(),
                        partial: partial(),
                    })
                }
                Some(Fault::Hang) => tokio::time::sleep(Duration::from_secs(3600)).await,
                _ => tokio::time::sleep(self.run_delay).await,
            }

            let code = self.files.lock().unwrap()[&instance.id].clone();
            let (termination, stdout, stderr) = if code.contains("syntax error") {
                (Termination::Exited(2), Vec::new(), b"main.go:1: syntax error".to_vec())
            } else {
                (Termination::Exited(0), code.into_bytes(), Vec::new())
            };
            instance.advance(SandboxState::Completed);
            Ok(ExecutionRecord {
                termination,
                stdout,
                stderr,
                wall_time: Duration::from_millis(3),
                usage: ResourceUsage {
                    utime: 1500,
                    maxrss: 2048,
                    ..ResourceUsage::default()
                },
                truncated: false,
            })
        }

        async fn destroy(&self, instance: &mut SandboxInstance) {
            if instance.advance(SandboxState::Destroyed) {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }

        async fn sweep_stale(&self, _max_age: Duration) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    fn orchestrator(backend: &Arc<FakeBackend>, config: Config) -> Orchestrator {
        let backend: Arc<dyn IsolationBackend> = Arc::clone(backend) as Arc<dyn IsolationBackend>;
        Orchestrator::new(backend, config)
    }

    async fn settle(backend: &FakeBackend) {
        for _ in 0..100 {
            if backend.live() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn successful_execution() {
        let backend = Arc::new(FakeBackend::default());
        let orch = orchestrator(&backend, Config::default());

        let result = orch.execute("package main").await;

        assert!(result.is_ok());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "package main");
        assert_eq!(result.stderr, "");
        assert_eq!(result.real_time, 3_000_000);
        assert_eq!(result.user_time, 1_500_000);
        assert_eq!(result.max_rss, 2048);
        assert_eq!(backend.live(), 0);
        assert_eq!(orch.live_instances(), 0);
    }

    #[tokio::test]
    async fn compile_failure_is_a_program_outcome() {
        let backend = Arc::new(FakeBackend::default());
        let orch = orchestrator(&backend, Config::default());

        let result = orch.execute("syntax error").await;

        assert_eq!(result.status, "nonzero_exit");
        assert_eq!(result.exit_code, 2);
        assert!(result.stdout.is_empty());
        assert!(!result.stderr.is_empty());
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn every_failing_stage_cleans_up() {
        let cases = [
            (Fault::Provision, "provisioning_error", ""),
            (Fault::Inject, "injection_error", ""),
            (Fault::Start, "start_error", ""),
            (Fault::Timeout, "timeout", "half"),
            (Fault::Wait, "wait_error", "half"),
            (Fault::Parse, "record_parse_error", "half"),
        ];

        for (fault, status, stdout) in cases {
            let backend = Arc::new(FakeBackend::failing(fault));
            let orch = orchestrator(&backend, Config::default());

            let result = orch.execute("package main").await;

            assert_eq!(result.status, status, "{fault:?}");
            assert_eq!(result.stdout, stdout, "{fault:?}");
            assert_eq!(result.exit_code, -1);
            assert_eq!(backend.live(), 0, "{fault:?} leaked an instance");
            assert_eq!(orch.live_instances(), 0);
        }
    }

    #[tokio::test]
    async fn backend_ignoring_timeout_is_cut_off() {
        let backend = Arc::new(FakeBackend::failing(Fault::Hang));
        let config = Config {
            timeout_seconds: 1,
            ..Config::default()
        };
        let orch = orchestrator(&backend, config).with_run_grace(Duration::from_millis(50));

        let result = orch.execute("for {}").await;

        assert_eq!(result.status, "timeout");
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_still_destroys_instance() {
        let backend = Arc::new(FakeBackend::failing(Fault::Hang));
        let config = Config {
            timeout_seconds: 0,
            ..Config::default()
        };
        let orch = orchestrator(&backend, config);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), orch.execute("for {}")).await;
        assert!(cancelled.is_err());
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 1);

        settle(&backend).await;
        assert_eq!(backend.live(), 0);
        assert_eq!(orch.live_instances(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_are_isolated_and_bounded() {
        let backend = Arc::new(FakeBackend {
            run_delay: Duration::from_millis(20),
            ..FakeBackend::default()
        });
        let config = Config {
            max_concurrent: 2,
            ..Config::default()
        };
        let orch = orchestrator(&backend, config);

        let codes: Vec<String> = (0..8).map(|i| format!("program {i}")).collect();
        let results =
            futures::future::join_all(codes.iter().map(|code| orch.execute(code))).await;

        for (code, result) in codes.iter().zip(&results) {
            assert!(result.is_ok());
            assert_eq!(&result.stdout, code);
        }
        assert_eq!(backend.ids.lock().unwrap().len(), 8);
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn full_queue_reports_overloaded_without_provisioning() {
        let backend = Arc::new(FakeBackend::failing(Fault::Hang));
        let config = Config {
            timeout_seconds: 0,
            max_concurrent: 1,
            queue_timeout_seconds: 0,
            ..Config::default()
        };
        let orch = orchestrator(&backend, config);

        let busy = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.execute("for {}").await })
        };
        for _ in 0..100 {
            if backend.live() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orch.live_instances(), 1);

        let result = orch.execute("package main").await;
        assert_eq!(result.status, "overloaded");
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 1);

        busy.abort();
        let _ = busy.await;
        settle(&backend).await;
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_backend() {
        let backend = Arc::new(FakeBackend::default());
        let config = Config {
            max_code_bytes: 8,
            ..Config::default()
        };
        let orch = orchestrator(&backend, config);

        for body in [
            &br#"{"code": 5}"#[..],
            br#"{"code": "x", "lang": "go"}"#,
            b"not json",
            br#"{"code": "far too long"}"#,
        ] {
            let result = orch.execute_request(body).await;
            assert_eq!(result.status, "invalid_request");
        }
        assert_eq!(orch.execute("far too long").await.status, "invalid_request");
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 0);

        let result = orch.execute_request(br#"{"code": "ok"}"#).await;
        assert!(result.is_ok());
        assert_eq!(result.stdout, "ok");
    }

    fn local_orchestrator(root: &std::path::Path, timeout_seconds: u64) -> Orchestrator {
        let config = Config {
            entry_file: "main.sh".into(),
            run_command: vec!["sh".into(), "main.sh".into()],
            timeout_seconds,
            ..Config::default()
        };
        let backend = LocalBackend::new(root.to_path_buf(), None);
        Orchestrator::new(Arc::new(backend), config)
    }

    fn sandbox_dirs(root: &std::path::Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn local_run_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let orch = local_orchestrator(root.path(), 10);

        let result = orch.execute("echo hello").await;
        assert_eq!(result.status, "ok");
        assert_eq!(result.stdout, "hello\n");
        assert!(result.real_time > 0);

        let result = orch.execute("echo oops >&2; exit 4").await;
        assert_eq!(result.status, "nonzero_exit");
        assert_eq!(result.exit_code, 4);
        assert_eq!(result.stderr, "oops\n");

        assert_eq!(sandbox_dirs(root.path()), 0);
    }

    fn exited(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).map_or(true, |stat| {
            stat.rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with(['Z', 'X']))
        })
    }

    #[tokio::test]
    async fn cancelled_local_run_leaves_no_processes() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let pid_file = scratch.path().join("pid");
        let orch = local_orchestrator(root.path(), 0);

        let task = {
            let orch = orch.clone();
            let script = format!("sleep 120 &\necho $! > {}\nwait", pid_file.display());
            tokio::spawn(async move { orch.execute(&script).await })
        };
        let pid: i32 = loop {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if text.ends_with('\n') {
                    break text.trim().parse().unwrap();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        for _ in 0..200 {
            if exited(pid) && orch.live_instances() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(exited(pid), "background process {pid} survived cancellation");
        assert_eq!(orch.live_instances(), 0);
        assert_eq!(sandbox_dirs(root.path()), 0);
    }

    #[tokio::test]
    async fn local_timeout_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let orch = local_orchestrator(root.path(), 1);

        let started = Instant::now();
        let result = orch.execute("echo started; sleep 30").await;

        assert_eq!(result.status, "timeout");
        assert_eq!(result.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(sandbox_dirs(root.path()), 0);
    }
}
