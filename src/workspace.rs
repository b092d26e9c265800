//! Task workspaces.
//!
//! A [`Task`] exclusively owns one directory tree:
//!
//! ```text
//! <root>/
//!     immutable/<project>/     pristine copy, never written after open
//!     git/<project>/           single-commit mirror for checking diffs
//!     <sandbox-key>/...        one subtree per identity, see SandboxLayout
//! ```
//!
//! Access to a sandbox goes through a [`SandboxLease`], which holds that
//! identity's lock. Two leases for the same key never coexist; leases for
//! different keys never wait on each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::identity::{identity, SandboxKey};
use crate::patch::Patch;
use crate::sandbox::git::{self, ApplyOutcome};
use crate::sandbox::SandboxLayout;
use crate::sanitizer::Sanitizer;
use crate::tool::{copy_tree, remove_tree};

/// What to do with the workspace tree when the task ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Delete everything.
    #[default]
    Remove,
    /// Leave the tree on disk for postmortem inspection.
    Keep,
}

/// Parameters for opening a task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Project identifier; also the source directory name in every sandbox.
    pub project: String,
    /// Pristine source tree. Only read, once, while opening.
    pub source: PathBuf,
    /// Sanitizers this task validates under. Must not be empty.
    pub sanitizers: Vec<Sanitizer>,
    /// Explicit workspace root. Must be absent or empty.
    pub workspace: Option<PathBuf>,
    /// Parent directory for a generated root. Defaults to the temp dir.
    pub workspace_base: Option<PathBuf>,
    /// Applied when the task is dropped without an explicit close.
    pub retention: Retention,
}

impl TaskConfig {
    /// Settings for `project` checked out at `source`, with one address
    /// sanitizer and a temporary workspace that is removed on close.
    pub fn new(project: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            source: source.into(),
            sanitizers: vec![Sanitizer::Address],
            workspace: None,
            workspace_base: None,
            retention: Retention::Remove,
        }
    }

    /// Sanitizers to build for; the first one is primary.
    pub fn with_sanitizers(mut self, sanitizers: Vec<Sanitizer>) -> Self {
        self.sanitizers = sanitizers;
        self
    }

    /// Uses exactly `workspace` as the task root.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Creates the task root as a fresh directory under `base`.
    pub fn with_workspace_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.workspace_base = Some(base.into());
        self
    }

    /// What happens to the workspace when the task is dropped.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

/// Exclusive access to one sandbox for as long as it is alive.
#[derive(Debug)]
pub struct SandboxLease {
    layout: SandboxLayout,
    _guard: OwnedMutexGuard<()>,
}

impl SandboxLease {
    /// Directories of the leased sandbox.
    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    /// Identity of the leased sandbox.
    pub fn key(&self) -> &SandboxKey {
        self.layout.key()
    }
}

/// One validation session over one project.
#[derive(Debug)]
pub struct Task {
    project: String,
    sanitizers: Vec<Sanitizer>,
    root: PathBuf,
    immutable: PathBuf,
    git_mirror: PathBuf,
    sandboxes: std::sync::Mutex<HashMap<SandboxKey, Arc<Mutex<()>>>>,
    mirror_lock: Mutex<()>,
    closed: AtomicBool,
    finished: AtomicBool,
    retention: Retention,
}

impl Task {
    /// Creates the workspace tree for a new task.
    ///
    /// On failure nothing created here is left behind.
    pub async fn open(config: TaskConfig) -> Result<Self> {
        validate_project_name(&config.project)?;
        if config.sanitizers.is_empty() {
            return Err(Error::Config("at least one sanitizer is required".to_string()));
        }
        if !config.source.is_dir() {
            return Err(Error::Config(format!(
                "source {} is not a directory",
                config.source.display()
            )));
        }

        let root = absolute(&workspace_root(&config))?;
        if root.exists() && !is_empty_dir(&root)? {
            return Err(Error::Workspace {
                path: root,
                reason: "workspace directory exists and is not empty".to_string(),
            });
        }
        let created_root = !root.exists();

        let (immutable, git_mirror) =
            match populate(&root, &config.project, &config.source).await {
                Ok(paths) => paths,
                Err(e) => {
                    discard_partial(&root, created_root).await;
                    tracing::error!(path = ?root, error = %e, "failed to open task workspace");
                    return Err(Error::Workspace {
                        path: root,
                        reason: e.to_string(),
                    });
                }
            };

        tracing::info!(
            project = %config.project,
            workspace = ?root,
            sanitizers = ?config.sanitizers,
            "opened task"
        );

        Ok(Self {
            project: config.project,
            sanitizers: config.sanitizers,
            root,
            immutable,
            git_mirror,
            sandboxes: std::sync::Mutex::new(HashMap::new()),
            mirror_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            retention: config.retention,
        })
    }

    /// Project name, also the source directory name inside workers.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Sanitizers the task was opened with.
    pub fn sanitizers(&self) -> &[Sanitizer] {
        &self.sanitizers
    }

    /// The first configured sanitizer.
    pub fn primary_sanitizer(&self) -> Sanitizer {
        self.sanitizers[0]
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The pristine copy every sandbox is materialized from.
    pub fn immutable_source(&self) -> &Path {
        &self.immutable
    }

    /// Git checkout used to check and format patches.
    pub fn git_mirror(&self) -> &Path {
        &self.git_mirror
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Layout of the sandbox for `key`, without taking its lease.
    pub fn layout(&self, key: &SandboxKey) -> SandboxLayout {
        SandboxLayout::new(&self.root, key, &self.project)
    }

    /// Returns the lease for `key`, creating its directory on first use.
    ///
    /// Waits while another lease for the same key is alive.
    pub async fn resolve_sandbox(&self, key: &SandboxKey) -> Result<SandboxLease> {
        if self.is_closed() {
            return Err(Error::TaskClosed);
        }

        let slot = {
            let mut sandboxes = self.sandboxes.lock().unwrap_or_else(|p| p.into_inner());
            sandboxes.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;

        // close() may have started while we waited.
        if self.is_closed() {
            return Err(Error::TaskClosed);
        }

        let layout = self.layout(key);
        tokio::fs::create_dir_all(layout.root())
            .await
            .map_err(|e| Error::from(e).in_sandbox(key))?;

        tracing::debug!(identity = %key, "sandbox lease acquired");
        Ok(SandboxLease {
            layout,
            _guard: guard,
        })
    }

    /// Ends the task.
    ///
    /// New leases are refused immediately; the call then waits for every
    /// outstanding lease before touching the tree. Once it has succeeded,
    /// calling it again is a no-op.
    pub async fn close(&self, retention: Retention) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<Arc<Mutex<()>>> = {
            let sandboxes = self.sandboxes.lock().unwrap_or_else(|p| p.into_inner());
            sandboxes.values().cloned().collect()
        };
        for slot in slots {
            let _in_flight_done = slot.lock().await;
        }
        let _mirror = self.mirror_lock.lock().await;

        if self.finished.load(Ordering::SeqCst) {
            return Ok(());
        }

        // A failed removal leaves the task unfinished so a later close or
        // the drop can try again.
        match retention {
            Retention::Keep => {
                tracing::info!(workspace = ?self.root, "task closed, workspace retained");
            }
            Retention::Remove => {
                remove_tree(&self.root).await.map_err(|e| Error::Workspace {
                    path: self.root.clone(),
                    reason: e.to_string(),
                })?;
                tracing::info!(workspace = ?self.root, "task closed, workspace removed");
            }
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Checks that `patch` applies cleanly to the pristine source.
    pub async fn check_patch(&self, patch: &Patch) -> Result<()> {
        if patch.is_baseline() {
            return Ok(());
        }
        let _mirror = self.mirror_lock.lock().await;

        git::reset(&self.git_mirror).await?;
        let outcome = git::apply(&self.git_mirror, patch, true).await?;
        git::reset(&self.git_mirror).await?;

        match outcome {
            ApplyOutcome::Applied => Ok(()),
            ApplyOutcome::Rejected(reason) => Err(Error::PatchApplication {
                identity: identity(patch, self.primary_sanitizer()),
                reason,
            }),
        }
    }

    /// Applies `patch` with fuzzy context matching and returns the
    /// equivalent exact diff, or `None` when it does not apply at all.
    pub async fn format_patch(&self, patch: &Patch) -> Result<Option<Patch>> {
        if patch.is_baseline() {
            return Ok(Some(Patch::baseline()));
        }
        let _mirror = self.mirror_lock.lock().await;

        git::reset(&self.git_mirror).await?;
        let formatted = match git::fuzzy_apply(&self.git_mirror, patch).await? {
            ApplyOutcome::Applied => Some(Patch::new(git::diff(&self.git_mirror).await?)),
            ApplyOutcome::Rejected(reason) => {
                tracing::debug!(reason = %reason, "patch could not be formatted");
                None
            }
        };
        git::reset(&self.git_mirror).await?;

        Ok(formatted)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.finished.load(Ordering::SeqCst) || self.retention == Retention::Keep {
            return;
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(error = %e, path = ?self.root, "failed to remove workspace on drop");
            }
        }
    }
}

fn validate_project_name(project: &str) -> Result<()> {
    let valid = !project.is_empty()
        && project != "."
        && project != ".."
        && project != "immutable"
        && project != "git"
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid project name '{}'", project)))
    }
}

fn workspace_root(config: &TaskConfig) -> PathBuf {
    if let Some(explicit) = &config.workspace {
        return explicit.clone();
    }
    let base = config
        .workspace_base
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let id = uuid::Uuid::new_v4().simple().to_string();
    base.join(format!("patch-sandbox-{}-{}", config.project, &id[..8]))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(std::fs::read_dir(path)?.next().is_none())
}

async fn populate(root: &Path, project: &str, source: &Path) -> Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(root).await?;

    let immutable = root.join("immutable").join(project);
    copy_tree(source, &immutable).await?;

    let git_mirror = root.join("git").join(project);
    copy_tree(&immutable, &git_mirror).await?;
    git::init_mirror(&git_mirror).await?;

    Ok((immutable, git_mirror))
}

async fn discard_partial(root: &Path, created_root: bool) {
    let targets = if created_root {
        vec![root.to_path_buf()]
    } else {
        vec![root.join("immutable"), root.join("git")]
    };
    for target in targets {
        if let Err(e) = remove_tree(&target).await {
            tracing::warn!(path = ?target, error = %e, "failed to discard partial workspace");
        }
    }
}
