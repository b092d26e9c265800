//! Build and reproduce patches end to end.
//!
//! [`PatchBuilder`] is the entry point for a patch-generation collaborator:
//! hand it a patch and a sanitizer and it hashes, leases, materializes,
//! builds and (optionally) replays a proof of concept, holding the sandbox
//! lease for the whole request.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::backend::ExecutionBackend;
use crate::config::SandboxConfig;
use crate::driver::{DriverProfile, ExecutionDriver, RunRequest};
use crate::error::{Error, Result};
use crate::identity::{identity, SandboxKey};
use crate::inject::{
    finalize_compile_log, inject_compile_interception, inject_debug_flags, ToolingStatus,
    COMPILE_LOG,
};
use crate::patch::Patch;
use crate::paths::MountTable;
use crate::sandbox::{materialize, Materialization, SandboxLayout};
use crate::sanitizer::Sanitizer;
use crate::tool::remove_tree;
use crate::verdict::Verdict;
use crate::workspace::{SandboxLease, Task};

/// A stored input known to trigger a defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poc {
    pub path: PathBuf,
    /// Fuzz harness the input is fed to.
    pub harness: String,
}

impl Poc {
    pub fn new(path: impl Into<PathBuf>, harness: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            harness: harness.into(),
        }
    }
}

/// Where a build left its products (control paths).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    pub out_dir: PathBuf,
    /// Compilation log in the sandbox source root, when one was produced.
    pub compile_commands: Option<PathBuf>,
}

impl BuildArtifacts {
    fn collect(layout: &SandboxLayout) -> Self {
        let log = layout.source().join(COMPILE_LOG);
        Self {
            out_dir: layout.out().to_path_buf(),
            compile_commands: log.is_file().then_some(log),
        }
    }
}

/// Everything a build request produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub verdict: Verdict,
    pub materialization: Materialization,
    pub artifacts: BuildArtifacts,
    pub tooling: ToolingStatus,
}

/// Knobs for builds and reproductions.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub build_timeout: Duration,
    pub reproduce_timeout: Duration,
    pub check_build: bool,
    pub compile_interception: Option<PathBuf>,
    pub debug_flags: bool,
    /// Relative to the sandbox source.
    pub build_script: PathBuf,
    /// Registry the builder image is pulled from, if any.
    pub registry: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(3600),
            reproduce_timeout: Duration::from_secs(360),
            check_build: true,
            compile_interception: None,
            debug_flags: false,
            build_script: PathBuf::from("build.sh"),
            registry: None,
        }
    }
}

impl BuildOptions {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            build_timeout: config.build_timeout(),
            reproduce_timeout: config.reproduce_timeout(),
            check_build: config.check_build,
            compile_interception: config.compile_interception.clone(),
            debug_flags: config.debug_flags,
            build_script: config.build_script.clone(),
            registry: config.images.registry.clone(),
        }
    }
}

/// Builds and replays patches for one task.
pub struct PatchBuilder<B: ExecutionBackend> {
    task: Arc<Task>,
    driver: ExecutionDriver<B>,
    options: BuildOptions,
    image_ready: OnceCell<()>,
}

impl<B: ExecutionBackend> PatchBuilder<B> {
    pub fn new(
        task: Arc<Task>,
        backend: Arc<B>,
        profile: DriverProfile,
        options: BuildOptions,
    ) -> Self {
        Self {
            task,
            driver: ExecutionDriver::new(backend, profile),
            options,
            image_ready: OnceCell::new(),
        }
    }

    pub fn from_config(task: Arc<Task>, backend: Arc<B>, config: &SandboxConfig) -> Result<Self> {
        Ok(Self::new(
            task,
            backend,
            config.driver_profile()?,
            BuildOptions::from_config(config),
        ))
    }

    /// Returns the task whose sandboxes are built.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Returns the driver that launches workers.
    pub fn driver(&self) -> &ExecutionDriver<B> {
        &self.driver
    }

    /// Returns the build and reproduction knobs.
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Builds `patch` under `sanitizer`.
    pub async fn build(&self, patch: &Patch, sanitizer: Sanitizer) -> Result<BuildOutcome> {
        let key = identity(patch, sanitizer);
        let lease = self.task.resolve_sandbox(&key).await?;
        self.build_leased(&lease, patch, sanitizer).await
    }

    /// Builds `patch` under every configured sanitizer, stopping at the
    /// first one that does not succeed.
    pub async fn build_all(&self, patch: &Patch) -> Result<Vec<BuildOutcome>> {
        let mut outcomes = Vec::new();
        for &sanitizer in self.task.sanitizers() {
            let outcome = self.build(patch, sanitizer).await?;
            let succeeded = outcome.verdict.is_success();
            outcomes.push(outcome);
            if !succeeded {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Replays `poc` against `patch` built under `sanitizer`.
    ///
    /// If the build does not succeed its verdict is returned instead.
    pub async fn reproduce(&self, poc: &Poc, patch: &Patch, sanitizer: Sanitizer) -> Result<Verdict> {
        if !poc.path.is_file() {
            return Err(Error::MissingPoc(poc.path.clone()));
        }

        let key = identity(patch, sanitizer);
        let lease = self.task.resolve_sandbox(&key).await?;

        let built = self.build_leased(&lease, patch, sanitizer).await?;
        if !built.verdict.is_success() {
            return Ok(built.verdict);
        }

        let staged = StagedPoc::stage(lease.layout(), &poc.path)
            .await
            .map_err(|e| e.in_sandbox(&key))?;
        let mounts = MountTable::for_reproduce(lease.layout(), staged.path())
            .map_err(|e| e.in_sandbox(&key))?;
        let request = RunRequest::Reproduce {
            sanitizer,
            harness: poc.harness.clone(),
        };

        self.driver
            .run(&lease, &request, &mounts, self.options.reproduce_timeout)
            .await
    }

    /// Reproduces under each configured sanitizer; the first crash wins,
    /// otherwise the last verdict is returned.
    pub async fn replay(&self, poc: &Poc, patch: &Patch) -> Result<Verdict> {
        let mut last = None;
        for &sanitizer in self.task.sanitizers() {
            let verdict = self.reproduce(poc, patch, sanitizer).await?;
            if verdict.is_crash() {
                return Ok(verdict);
            }
            last = Some(verdict);
        }
        last.ok_or_else(|| Error::Config("no sanitizers configured".to_string()))
    }

    /// Mount table of the baseline sandbox under the primary sanitizer,
    /// for mapping worker paths in debugger sessions back to control paths.
    pub fn debug_source_map(&self, poc: Option<&Poc>) -> Result<MountTable> {
        let key = SandboxKey::baseline(self.task.primary_sanitizer());
        let layout = self.task.layout(&key);
        match poc {
            Some(poc) => MountTable::for_reproduce(&layout, &poc.path),
            None => MountTable::for_build(&layout),
        }
    }

    async fn build_leased(
        &self,
        lease: &SandboxLease,
        patch: &Patch,
        sanitizer: Sanitizer,
    ) -> Result<BuildOutcome> {
        let layout = lease.layout();
        let key = lease.key();

        let materialization = materialize(lease, self.task.immutable_source(), patch).await?;

        if layout.is_built() {
            tracing::info!(identity = %key, "reusing earlier build");
            let artifacts = BuildArtifacts::collect(layout);
            let tooling = if artifacts.compile_commands.is_some() {
                ToolingStatus::Injected
            } else {
                ToolingStatus::NotRequested
            };
            return Ok(BuildOutcome {
                verdict: Verdict::cached(key),
                materialization,
                artifacts,
                tooling,
            });
        }

        self.prepare_image().await.map_err(|e| e.in_sandbox(key))?;

        if self.options.debug_flags {
            inject_debug_flags(&layout.source().join(&self.options.build_script))
                .await
                .map_err(|e| e.in_sandbox(key))?;
        }

        let (mut tooling, entry_point) = match &self.options.compile_interception {
            None => (ToolingStatus::NotRequested, None),
            Some(assets) => match inject_compile_interception(layout, assets).await {
                Ok(injected) => (ToolingStatus::Injected, Some(injected.entry_point)),
                Err(e) => {
                    tracing::warn!(identity = %key, error = %e, "compile interception unavailable");
                    (ToolingStatus::Unavailable(e.to_string()), None)
                }
            },
        };

        reset_dir(layout.out()).await.map_err(|e| e.in_sandbox(key))?;
        reset_dir(layout.work()).await.map_err(|e| e.in_sandbox(key))?;

        let mounts = MountTable::for_build(layout).map_err(|e| e.in_sandbox(key))?;
        let request = RunRequest::Build {
            sanitizer,
            entry_point,
        };
        let mut verdict = self
            .driver
            .run(lease, &request, &mounts, self.options.build_timeout)
            .await?;

        if verdict.is_success() && tooling == ToolingStatus::Injected {
            if let Err(e) = finalize_compile_log(layout).await {
                tracing::warn!(identity = %key, error = %e, "compile log could not be finalized");
                tooling = ToolingStatus::Unavailable(e.to_string());
            }
        }

        if verdict.is_success() && self.options.check_build {
            let check = self
                .driver
                .run(
                    lease,
                    &RunRequest::CheckBuild { sanitizer },
                    &mounts,
                    self.options.build_timeout,
                )
                .await?;
            if !check.is_success() {
                tracing::warn!(identity = %key, status = ?check.status, "build check failed");
                verdict = check;
            }
        }

        if verdict.is_success() {
            tokio::fs::write(layout.build_marker(), patch.as_str())
                .await
                .map_err(|e| Error::from(e).in_sandbox(key))?;
        }

        Ok(BuildOutcome {
            verdict,
            materialization,
            artifacts: BuildArtifacts::collect(layout),
            tooling,
        })
    }

    async fn prepare_image(&self) -> Result<()> {
        self.image_ready
            .get_or_try_init(|| async {
                let profile = self.driver.profile();
                let remote = self
                    .options
                    .registry
                    .as_ref()
                    .map(|registry| format!("{}/{}:latest", registry, profile.project));
                self.driver
                    .backend()
                    .prepare_image(&profile.builder_image, remote.as_deref())
                    .await
            })
            .await
            .map(|_| ())
    }
}

async fn reset_dir(dir: &Path) -> Result<()> {
    remove_tree(dir).await?;
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// A private copy of a PoC inside the sandbox work directory, deleted when
/// dropped.
struct StagedPoc {
    path: PathBuf,
}

impl StagedPoc {
    async fn stage(layout: &SandboxLayout, poc: &Path) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        tokio::fs::create_dir_all(layout.work()).await?;
        let path = layout.work().join(format!(".testcase-{}", &id[..8]));
        tokio::fs::copy(poc, &path)
            .await
            .map_err(|_| Error::MissingPoc(poc.to_path_buf()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedPoc {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "failed to remove staged testcase");
            }
        }
    }
}
