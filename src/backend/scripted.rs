//! In-process backend driven by a script.
//!
//! Each launch is answered by calling the script with the [`LaunchSpec`].
//! Files a scripted worker "writes" are addressed by worker path and land
//! wherever the launch's mount table maps them, exactly as a real bind
//! mount would.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::identity::SandboxKey;
use crate::paths::MountMode;

use super::{ExecutionBackend, LaunchSpec, WorkerExit, WorkerHandle, WorkerLogs};

/// What a scripted worker does.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Runs for `delay`, writes files, then exits.
    Exit {
        code: i32,
        logs: WorkerLogs,
        delay: Duration,
        writes: Vec<(PathBuf, Vec<u8>)>,
    },
    /// Never exits on its own.
    Hang { logs: WorkerLogs },
    /// The launch itself fails.
    LaunchFailure(String),
    /// The backend is down.
    Unavailable(String),
}

impl ScriptedOutcome {
    pub fn exit(code: i32) -> Self {
        ScriptedOutcome::Exit {
            code,
            logs: WorkerLogs::default(),
            delay: Duration::ZERO,
            writes: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::exit(0)
    }

    pub fn hang() -> Self {
        ScriptedOutcome::Hang {
            logs: WorkerLogs::default(),
        }
    }

    pub fn with_stdout(mut self, text: impl Into<String>) -> Self {
        if let ScriptedOutcome::Exit { logs, .. } | ScriptedOutcome::Hang { logs } = &mut self {
            logs.stdout = text.into();
        }
        self
    }

    pub fn with_stderr(mut self, text: impl Into<String>) -> Self {
        if let ScriptedOutcome::Exit { logs, .. } | ScriptedOutcome::Hang { logs } = &mut self {
            logs.stderr = text.into();
        }
        self
    }

    pub fn after(mut self, duration: Duration) -> Self {
        if let ScriptedOutcome::Exit { delay, .. } = &mut self {
            *delay = duration;
        }
        self
    }

    /// Writes `contents` to `worker_path` before exiting.
    pub fn writing(mut self, worker_path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        if let ScriptedOutcome::Exit { writes, .. } = &mut self {
            writes.push((worker_path.into(), contents.into()));
        }
        self
    }
}

type Script = Box<dyn Fn(&LaunchSpec) -> ScriptedOutcome + Send + Sync>;

#[derive(Debug)]
struct Worker {
    spec: LaunchSpec,
    outcome: ScriptedOutcome,
    killed: bool,
}

#[derive(Debug, Default)]
struct State {
    launched: Vec<LaunchSpec>,
    live: HashMap<String, Worker>,
    removed: Vec<String>,
    prepared: Vec<String>,
    failing_removals: usize,
}

/// Backend whose workers follow a script.
pub struct ScriptedBackend {
    script: Script,
    launch_delay: Duration,
    state: Mutex<State>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&LaunchSpec) -> ScriptedOutcome + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            launch_delay: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Workers are registered at once but `launch` returns only after `delay`.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// The next `count` removals fail and leave the worker in place.
    pub fn with_failing_removals(self, count: usize) -> Self {
        self.state().failing_removals = count;
        self
    }

    /// Every worker exits 0 without output.
    pub fn always_succeeding() -> Self {
        Self::new(|_| ScriptedOutcome::success())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Specs of every launch, in order.
    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.state().launched.clone()
    }

    /// Names of workers not yet removed.
    pub fn live_workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of removed workers, in removal order.
    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    /// Names of workers that were killed before removal.
    pub fn was_killed(&self, name: &str) -> bool {
        self.state()
            .live
            .get(name)
            .map(|w| w.killed)
            .unwrap_or(false)
    }

    /// Local tags passed to `prepare_image`, in call order.
    pub fn prepared_images(&self) -> Vec<String> {
        self.state().prepared.clone()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn prepare_image(&self, local: &str, _remote: Option<&str>) -> Result<()> {
        self.state().prepared.push(local.to_string());
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle> {
        let outcome = (self.script)(spec);
        match &outcome {
            ScriptedOutcome::LaunchFailure(reason) => return Err(Error::Backend(reason.clone())),
            ScriptedOutcome::Unavailable(reason) => {
                return Err(Error::BackendUnavailable(reason.clone()))
            }
            _ => {}
        }

        {
            let mut state = self.state();
            if state.live.contains_key(&spec.name) {
                return Err(Error::Backend(format!("worker {} already exists", spec.name)));
            }
            state.launched.push(spec.clone());
            state.live.insert(
                spec.name.clone(),
                Worker {
                    spec: spec.clone(),
                    outcome,
                    killed: false,
                },
            );
        }

        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        Ok(WorkerHandle {
            name: spec.name.clone(),
        })
    }

    async fn wait(&self, worker: &WorkerHandle) -> Result<WorkerExit> {
        let (spec, outcome) = {
            let state = self.state();
            let live = state
                .live
                .get(&worker.name)
                .ok_or_else(|| Error::Backend(format!("no such worker {}", worker.name)))?;
            (live.spec.clone(), live.outcome.clone())
        };

        match outcome {
            ScriptedOutcome::Exit {
                code,
                logs,
                delay,
                writes,
            } => {
                tokio::time::sleep(delay).await;
                for (worker_path, contents) in writes {
                    let target = spec.mounts.to_control_path(&worker_path).ok_or_else(|| {
                        Error::Backend(format!("{} is not mounted", worker_path.display()))
                    })?;
                    let writable = spec
                        .mounts
                        .mounts()
                        .iter()
                        .filter(|m| worker_path.starts_with(&m.worker))
                        .max_by_key(|m| m.worker.components().count())
                        .map(|m| m.mode == MountMode::ReadWrite)
                        .unwrap_or(false);
                    if !writable {
                        return Err(Error::Backend(format!(
                            "{} is mounted read-only",
                            worker_path.display()
                        )));
                    }
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&target, contents).await?;
                }
                Ok(WorkerExit {
                    code: Some(code),
                    logs,
                })
            }
            ScriptedOutcome::Hang { .. } => std::future::pending().await,
            ScriptedOutcome::LaunchFailure(_) | ScriptedOutcome::Unavailable(_) => {
                Err(Error::Backend("worker never started".to_string()))
            }
        }
    }

    async fn kill(&self, worker: &WorkerHandle) -> Result<()> {
        if let Some(live) = self.state().live.get_mut(&worker.name) {
            live.killed = true;
        }
        Ok(())
    }

    async fn remove(&self, worker: &WorkerHandle) -> Result<()> {
        let mut state = self.state();
        if state.failing_removals > 0 && state.live.contains_key(&worker.name) {
            state.failing_removals -= 1;
            return Err(Error::Backend(format!("cannot remove {}", worker.name)));
        }
        if state.live.remove(&worker.name).is_some() {
            state.removed.push(worker.name.clone());
        }
        Ok(())
    }

    async fn logs(&self, worker: &WorkerHandle) -> Result<WorkerLogs> {
        let state = self.state();
        Ok(match state.live.get(&worker.name).map(|w| &w.outcome) {
            Some(ScriptedOutcome::Hang { logs }) | Some(ScriptedOutcome::Exit { logs, .. }) => {
                logs.clone()
            }
            _ => WorkerLogs::default(),
        })
    }

    async fn list(&self, identity: &SandboxKey) -> Result<Vec<WorkerHandle>> {
        Ok(self
            .state()
            .live
            .values()
            .filter(|w| &w.spec.identity == identity)
            .map(|w| WorkerHandle {
                name: w.spec.name.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::MountTable;
    use crate::sanitizer::Sanitizer;
    use tempfile::TempDir;

    fn spec(name: &str, out: &std::path::Path) -> LaunchSpec {
        let mut mounts = MountTable::new();
        mounts
            .push(out.to_path_buf(), "/out".into(), MountMode::ReadWrite)
            .unwrap();
        LaunchSpec {
            name: name.to_string(),
            identity: SandboxKey::baseline(Sanitizer::Address),
            image: "image".to_string(),
            mounts,
            env: Vec::new(),
            command: vec!["compile".to_string()],
            privileged: false,
        }
    }

    #[tokio::test]
    async fn writes_land_in_mounted_directories() {
        let temp = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(|_| {
            ScriptedOutcome::success()
                .with_stdout("built")
                .writing("/out/fuzzer", "ELF")
        });

        let handle = backend.launch(&spec("w1", temp.path())).await.unwrap();
        let exit = backend.wait(&handle).await.unwrap();

        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.logs.stdout, "built");
        assert_eq!(std::fs::read_to_string(temp.path().join("fuzzer")).unwrap(), "ELF");

        assert_eq!(backend.live_workers(), vec!["w1".to_string()]);
        backend.remove(&handle).await.unwrap();
        assert!(backend.live_workers().is_empty());
        assert_eq!(backend.removed(), vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn unmounted_writes_fail() {
        let temp = TempDir::new().unwrap();
        let backend =
            ScriptedBackend::new(|_| ScriptedOutcome::success().writing("/src/x", "data"));
        let handle = backend.launch(&spec("w2", temp.path())).await.unwrap();
        assert!(matches!(backend.wait(&handle).await, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn hanging_worker_can_be_listed_and_removed() {
        let temp = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(|_| ScriptedOutcome::hang());
        let launch = spec("w3", temp.path());
        let handle = backend.launch(&launch).await.unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(20), backend.wait(&handle)).await;
        assert!(waited.is_err());

        assert_eq!(backend.list(&launch.identity).await.unwrap().len(), 1);
        backend.kill(&handle).await.unwrap();
        assert!(backend.was_killed("w3"));
        backend.remove(&handle).await.unwrap();
        assert!(backend.list(&launch.identity).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_backend_fails_launch() {
        let temp = TempDir::new().unwrap();
        let backend =
            ScriptedBackend::new(|_| ScriptedOutcome::Unavailable("daemon down".to_string()));
        assert!(matches!(
            backend.launch(&spec("w4", temp.path())).await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(backend.launched().is_empty());
    }
}
