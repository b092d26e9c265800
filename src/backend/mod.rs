//! Execution backends that run workers.
//!
//! The driver only needs launch, wait, kill and remove, so any container or
//! process runtime exposing those can host workers. [`DockerBackend`] drives
//! the docker CLI; [`ScriptedBackend`] runs workers in-process from a script
//! and is used for tests and dry runs.

mod docker;
mod scripted;

pub use docker::DockerBackend;
pub use scripted::{ScriptedBackend, ScriptedOutcome};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::SandboxKey;
use crate::paths::MountTable;

/// Label put on every worker so leftovers can be found by identity.
pub const IDENTITY_LABEL: &str = "patch-sandbox.identity";

/// What docker prints when the daemon refuses a request.
pub(crate) const DAEMON_ERROR: &str = "docker: Error response from daemon:";

/// Exit status docker uses for its own failures.
pub(crate) const DOCKER_FAILURE_EXIT: i32 = 125;

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique worker name.
    pub name: String,
    /// Sandbox the worker operates on.
    pub identity: SandboxKey,
    pub image: String,
    pub mounts: MountTable,
    pub env: Vec<(String, String)>,
    pub command: Vec<String>,
    pub privileged: bool,
}

impl LaunchSpec {
    /// Returns the value of `key` in the worker environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A launched worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub name: String,
}

/// Output captured from a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLogs {
    pub stdout: String,
    pub stderr: String,
}

/// How a worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    pub logs: WorkerLogs,
}

/// Runtime that hosts workers.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    /// Returns the name of this backend.
    fn name(&self) -> &str;

    /// Makes `local` available, fetching it from `remote` when given.
    async fn prepare_image(&self, _local: &str, _remote: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Starts a worker. On success the worker exists until `remove`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle>;

    /// Waits for the worker to finish. Dropping the future must not leave
    /// the worker unreachable by `kill` and `remove`.
    async fn wait(&self, worker: &WorkerHandle) -> Result<WorkerExit>;

    /// Forcibly stops a running worker. Stopping a finished one is fine.
    async fn kill(&self, worker: &WorkerHandle) -> Result<()>;

    /// Stops and deletes the worker. Removing an absent worker is fine.
    async fn remove(&self, worker: &WorkerHandle) -> Result<()>;

    /// Output produced so far.
    async fn logs(&self, _worker: &WorkerHandle) -> Result<WorkerLogs> {
        Ok(WorkerLogs::default())
    }

    /// Workers that still exist for `identity`.
    async fn list(&self, identity: &SandboxKey) -> Result<Vec<WorkerHandle>>;
}
