//! Runs one worker against one sandbox.
//!
//! The driver owns the worker's whole lifecycle: launch, a hard wall-clock
//! wait, kill on timeout, and removal on every exit path. Removal is tied
//! to a guard, so a caller that abandons `run` mid-flight still gets the
//! worker reclaimed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{ExecutionBackend, LaunchSpec, WorkerHandle, WorkerLogs};
use crate::config::{Language, BUILDER_IMAGE_PREFIX, DEFAULT_RUNNER_IMAGE};
use crate::error::{Error, Result};
use crate::identity::SandboxKey;
use crate::paths::{MountTable, WORKER_TESTCASE};
use crate::sanitizer::Sanitizer;
use crate::verdict::{classify, Verdict};
use crate::workspace::SandboxLease;

/// What a worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRequest {
    /// Compile the project. `entry_point` replaces `compile` with an
    /// interception shim (worker path).
    Build {
        sanitizer: Sanitizer,
        entry_point: Option<PathBuf>,
    },
    /// Check that the built fuzzers are runnable.
    CheckBuild { sanitizer: Sanitizer },
    /// Run `harness` once against `/testcase`.
    Reproduce { sanitizer: Sanitizer, harness: String },
}

impl RunRequest {
    pub fn build(sanitizer: Sanitizer) -> Self {
        RunRequest::Build {
            sanitizer,
            entry_point: None,
        }
    }

    /// Returns the sanitizer the request builds or runs under.
    pub fn sanitizer(&self) -> Sanitizer {
        match self {
            RunRequest::Build { sanitizer, .. }
            | RunRequest::CheckBuild { sanitizer }
            | RunRequest::Reproduce { sanitizer, .. } => *sanitizer,
        }
    }

    /// Short name used in worker names and logs.
    pub fn mode(&self) -> &'static str {
        match self {
            RunRequest::Build { .. } => "build",
            RunRequest::CheckBuild { .. } => "check",
            RunRequest::Reproduce { .. } => "reproduce",
        }
    }
}

/// Per-project worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverProfile {
    pub project: String,
    pub builder_image: String,
    pub runner_image: String,
    pub fuzzing_engine: String,
    pub architecture: String,
    pub language: Language,
}

impl DriverProfile {
    /// OSS-Fuzz defaults for `project`.
    pub fn new(project: impl Into<String>) -> Self {
        let project = project.into();
        Self {
            builder_image: format!("{}/{}", BUILDER_IMAGE_PREFIX, project),
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            fuzzing_engine: "libfuzzer".to_string(),
            architecture: "x86_64".to_string(),
            language: Language::CLike,
            project,
        }
    }
}

/// Launches workers for sandboxes.
pub struct ExecutionDriver<B: ExecutionBackend> {
    backend: Arc<B>,
    profile: DriverProfile,
    /// Names of every worker this driver asked the backend to launch.
    issued: Mutex<HashSet<String>>,
}

impl<B: ExecutionBackend> ExecutionDriver<B> {
    pub fn new(backend: Arc<B>, profile: DriverProfile) -> Self {
        Self {
            backend,
            profile,
            issued: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the backend workers are launched on.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Returns the worker settings.
    pub fn profile(&self) -> &DriverProfile {
        &self.profile
    }

    /// Describes the worker for `request`.
    pub fn launch_spec(
        &self,
        identity: &SandboxKey,
        request: &RunRequest,
        mounts: &MountTable,
    ) -> LaunchSpec {
        let profile = &self.profile;
        let mut env = vec![
            ("FUZZING_ENGINE".to_string(), profile.fuzzing_engine.clone()),
            ("SANITIZER".to_string(), request.sanitizer().tag().to_string()),
            ("ARCHITECTURE".to_string(), profile.architecture.clone()),
            ("PROJECT_NAME".to_string(), profile.project.clone()),
            ("HELPER".to_string(), "True".to_string()),
        ];

        let (image, command) = match request {
            RunRequest::Build { entry_point, .. } => {
                let command = match entry_point {
                    Some(shim) => vec!["bash".to_string(), shim.display().to_string()],
                    None => vec!["compile".to_string()],
                };
                (profile.builder_image.clone(), command)
            }
            RunRequest::CheckBuild { .. } => {
                (profile.runner_image.clone(), vec!["test_all.py".to_string()])
            }
            RunRequest::Reproduce { harness, .. } => {
                env.push(("FUZZER".to_string(), harness.clone()));
                env.push(("TESTCASE".to_string(), WORKER_TESTCASE.to_string()));
                env.push(("RUN_FUZZER_MODE".to_string(), "interactive".to_string()));
                (
                    profile.runner_image.clone(),
                    vec![
                        "reproduce".to_string(),
                        harness.clone(),
                        "-runs=100".to_string(),
                    ],
                )
            }
        };

        let id = uuid::Uuid::new_v4().simple().to_string();
        LaunchSpec {
            name: format!(
                "patch-sandbox-{}-{}-{}",
                identity.short(),
                request.mode(),
                &id[..8]
            ),
            identity: identity.clone(),
            image,
            mounts: mounts.clone(),
            env,
            command,
            privileged: true,
        }
    }

    /// Runs `request` in the sandbox held by `lease`.
    ///
    /// Build failures, crashes and timeouts come back as verdicts; only
    /// infrastructure problems are errors. Either way the worker is gone
    /// when this returns.
    pub async fn run(
        &self,
        lease: &SandboxLease,
        request: &RunRequest,
        mounts: &MountTable,
        timeout: Duration,
    ) -> Result<Verdict> {
        let identity = lease.key();
        self.run_inner(lease, request, mounts, timeout)
            .await
            .map_err(|e| e.in_sandbox(identity))
    }

    async fn run_inner(
        &self,
        lease: &SandboxLease,
        request: &RunRequest,
        mounts: &MountTable,
        timeout: Duration,
    ) -> Result<Verdict> {
        let identity = lease.key();
        let sandbox_root = lease.layout().root();
        if let Some(outside) = mounts
            .mounts()
            .iter()
            .find(|m| !m.control.starts_with(sandbox_root))
        {
            return Err(Error::InvalidPath(outside.control.clone()));
        }

        let spec = self.launch_spec(identity, request, mounts);
        tracing::info!(
            identity = %identity,
            mode = request.mode(),
            worker = %spec.name,
            timeout = ?timeout,
            "launching worker"
        );

        self.sweep_stale(identity).await;

        // Guarded by name from before the launch; a request dropped while
        // the backend is still creating the worker removes it too.
        let handle = WorkerHandle {
            name: spec.name.clone(),
        };
        self.issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(spec.name.clone());
        let guard = WorkerGuard::new(self.backend.clone(), handle.clone());
        let started = Instant::now();
        if let Err(e) = self.backend.launch(&spec).await {
            guard.reclaim().await;
            return Err(e);
        }

        let result = match tokio::time::timeout(timeout, self.backend.wait(&handle)).await {
            Ok(Ok(exit)) => classify(
                identity,
                request,
                exit,
                started.elapsed(),
                self.profile.language,
            ),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    identity = %identity,
                    worker = %handle.name,
                    timeout = ?timeout,
                    "worker timed out, killing"
                );
                if let Err(e) = self.backend.kill(&handle).await {
                    tracing::warn!(worker = %handle.name, error = %e, "failed to kill worker");
                }
                let logs = match self.backend.logs(&handle).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        tracing::warn!(worker = %handle.name, error = %e, "failed to fetch logs");
                        WorkerLogs::default()
                    }
                };
                Ok(Verdict::timed_out(identity, logs, started.elapsed()))
            }
        };

        guard.reclaim().await;

        if let Ok(verdict) = &result {
            tracing::info!(
                identity = %identity,
                mode = request.mode(),
                status = ?verdict.status,
                duration = ?verdict.duration,
                "worker finished"
            );
        }
        result
    }

    /// Removes workers this driver launched for `identity` that outlived
    /// their run, such as one created after its request was abandoned.
    ///
    /// The caller holds the sandbox lease, so none of them is in use.
    /// Workers of other processes sharing the identity are left alone.
    async fn sweep_stale(&self, identity: &SandboxKey) {
        let listed = match self.backend.list(identity).await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "failed to list leftover workers");
                return;
            }
        };
        let stale: Vec<WorkerHandle> = {
            let issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
            listed
                .into_iter()
                .filter(|w| issued.contains(&w.name))
                .collect()
        };
        for worker in stale {
            tracing::warn!(identity = %identity, worker = %worker.name, "removing leftover worker");
            if let Err(e) = self.backend.remove(&worker).await {
                tracing::error!(worker = %worker.name, error = %e, "failed to remove leftover worker");
            }
        }
    }
}

/// Removes a worker when dropped, unless already reclaimed.
struct WorkerGuard<B: ExecutionBackend> {
    backend: Arc<B>,
    handle: Option<WorkerHandle>,
}

impl<B: ExecutionBackend> WorkerGuard<B> {
    fn new(backend: Arc<B>, handle: WorkerHandle) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    async fn reclaim(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.backend.remove(&handle).await {
                tracing::error!(worker = %handle.name, error = %e, "failed to remove worker");
            }
        }
    }
}

impl<B: ExecutionBackend> Drop for WorkerGuard<B> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = self.backend.clone();
                tracing::warn!(worker = %handle.name, "execution abandoned, removing worker");
                runtime.spawn(async move {
                    if let Err(e) = backend.remove(&handle).await {
                        tracing::error!(worker = %handle.name, error = %e, "failed to remove worker");
                    }
                });
            }
            Err(_) => {
                tracing::error!(worker = %handle.name, "no runtime left to remove worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;

    fn driver() -> ExecutionDriver<ScriptedBackend> {
        ExecutionDriver::new(
            Arc::new(ScriptedBackend::always_succeeding()),
            DriverProfile::new("demo"),
        )
    }

    #[test]
    fn build_spec_uses_builder_image_and_compile() {
        let key = SandboxKey::baseline(Sanitizer::Memory);
        let spec = driver().launch_spec(&key, &RunRequest::build(Sanitizer::Memory), &MountTable::new());

        assert_eq!(spec.image, "gcr.io/oss-fuzz/demo");
        assert_eq!(spec.command, vec!["compile"]);
        assert_eq!(spec.env_value("SANITIZER"), Some("memory"));
        assert_eq!(spec.env_value("FUZZING_ENGINE"), Some("libfuzzer"));
        assert_eq!(spec.env_value("PROJECT_NAME"), Some("demo"));
        assert!(spec.privileged);
        assert!(spec.name.starts_with(&format!("patch-sandbox-{}-build-", key.short())));
    }

    #[test]
    fn build_spec_runs_interception_shim() {
        let key = SandboxKey::baseline(Sanitizer::Address);
        let request = RunRequest::Build {
            sanitizer: Sanitizer::Address,
            entry_point: Some(PathBuf::from("/src/demo/.bear/bear.sh")),
        };
        let spec = driver().launch_spec(&key, &request, &MountTable::new());
        assert_eq!(spec.command, vec!["bash", "/src/demo/.bear/bear.sh"]);
    }

    #[test]
    fn reproduce_spec_targets_the_testcase() {
        let key = SandboxKey::baseline(Sanitizer::Address);
        let request = RunRequest::Reproduce {
            sanitizer: Sanitizer::Address,
            harness: "fuzz_parse".to_string(),
        };
        let spec = driver().launch_spec(&key, &request, &MountTable::new());

        assert_eq!(spec.image, DEFAULT_RUNNER_IMAGE);
        assert_eq!(spec.command, vec!["reproduce", "fuzz_parse", "-runs=100"]);
        assert_eq!(spec.env_value("FUZZER"), Some("fuzz_parse"));
        assert_eq!(spec.env_value("TESTCASE"), Some("/testcase"));
    }

    #[test]
    fn worker_names_are_unique() {
        let key = SandboxKey::baseline(Sanitizer::Address);
        let request = RunRequest::CheckBuild {
            sanitizer: Sanitizer::Address,
        };
        let d = driver();
        let a = d.launch_spec(&key, &request, &MountTable::new());
        let b = d.launch_spec(&key, &request, &MountTable::new());
        assert_ne!(a.name, b.name);
        assert_eq!(a.command, vec!["test_all.py"]);
    }
}
