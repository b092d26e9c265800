//! Path translation between the host, control-process and worker namespaces.
//!
//! A worker only sees what its [`MountTable`] lists. Every cross-boundary
//! reference is an explicit (control path, worker path) pair; nothing here
//! consults a global root. When the control process itself runs in a
//! container, [`HostPaths`] maps control paths onto the host paths the
//! container engine understands.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::SandboxLayout;

/// Worker-side artifact directory.
pub const WORKER_OUT: &str = "/out";

/// Worker-side scratch directory.
pub const WORKER_WORK: &str = "/work";

/// Worker-side location of the proof of concept.
pub const WORKER_TESTCASE: &str = "/testcase";

/// Worker-side source directory for `project`.
pub fn worker_source_dir(project: &str) -> PathBuf {
    Path::new("/src").join(project)
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// One bind mount for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMount {
    /// Absolute path in the control-process namespace.
    pub control: PathBuf,
    /// Absolute path inside the worker.
    pub worker: PathBuf,
    pub mode: MountMode,
}

/// The mounts visible to a single worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTable {
    mounts: Vec<WorkerMount>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mount. Both sides must be absolute and normalized, and each
    /// worker path may be mounted only once.
    pub fn push(&mut self, control: PathBuf, worker: PathBuf, mode: MountMode) -> Result<()> {
        let control = normalized(&control).ok_or(Error::InvalidPath(control))?;
        let worker = normalized(&worker).ok_or(Error::InvalidPath(worker))?;
        if self.mounts.iter().any(|m| m.worker == worker) {
            return Err(Error::InvalidPath(worker));
        }
        self.mounts.push(WorkerMount {
            control,
            worker,
            mode,
        });
        Ok(())
    }

    /// Returns the mounts in insertion order.
    pub fn mounts(&self) -> &[WorkerMount] {
        &self.mounts
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Mounts for a build: source, artifacts and scratch, all read-write.
    pub fn for_build(layout: &SandboxLayout) -> Result<Self> {
        let mut table = Self::new();
        table.push(
            layout.source().to_path_buf(),
            worker_source_dir(layout.project()),
            MountMode::ReadWrite,
        )?;
        table.push(layout.out().to_path_buf(), WORKER_OUT.into(), MountMode::ReadWrite)?;
        table.push(layout.work().to_path_buf(), WORKER_WORK.into(), MountMode::ReadWrite)?;
        Ok(table)
    }

    /// Mounts for a reproduction: the built sandbox plus the testcase,
    /// read-only.
    pub fn for_reproduce(layout: &SandboxLayout, testcase: &Path) -> Result<Self> {
        let mut table = Self::new();
        table.push(
            layout.source().to_path_buf(),
            worker_source_dir(layout.project()),
            MountMode::ReadOnly,
        )?;
        table.push(layout.out().to_path_buf(), WORKER_OUT.into(), MountMode::ReadWrite)?;
        table.push(layout.work().to_path_buf(), WORKER_WORK.into(), MountMode::ReadWrite)?;
        table.push(
            testcase.to_path_buf(),
            WORKER_TESTCASE.into(),
            MountMode::ReadOnly,
        )?;
        Ok(table)
    }

    /// Maps a control-process path to where the worker sees it.
    pub fn to_worker_path(&self, control: &Path) -> Option<PathBuf> {
        let control = normalized(control)?;
        self.mounts
            .iter()
            .filter_map(|m| {
                let rest = control.strip_prefix(&m.control).ok()?;
                Some((m.control.components().count(), join_rest(&m.worker, rest)))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, path)| path)
    }

    /// Maps a worker path back into the control-process namespace.
    pub fn to_control_path(&self, worker: &Path) -> Option<PathBuf> {
        let worker = normalized(worker)?;
        self.mounts
            .iter()
            .filter_map(|m| {
                let rest = worker.strip_prefix(&m.worker).ok()?;
                Some((m.worker.components().count(), join_rest(&m.control, rest)))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, path)| path)
    }

    /// Rewrites a worker-path argument (e.g. `/testcase`) to its control
    /// path. Anything that is not a mapped absolute path comes back as is.
    pub fn resolve_token(&self, token: &str) -> String {
        if !token.starts_with('/') {
            return token.to_string();
        }
        match self.to_control_path(Path::new(token)) {
            Some(path) => path.display().to_string(),
            None => token.to_string(),
        }
    }
}

/// Free-function form of [`MountTable::to_worker_path`].
pub fn to_worker_path(control: &Path, table: &MountTable) -> Option<PathBuf> {
    table.to_worker_path(control)
}

/// Free-function form of [`MountTable::to_control_path`].
pub fn to_control_path(worker: &Path, table: &MountTable) -> Option<PathBuf> {
    table.to_control_path(worker)
}

/// A control-path prefix and the host path it corresponds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub control: PathBuf,
    pub host: PathBuf,
}

/// How control-process paths are expressed to the container engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostPaths {
    /// The control process shares the host's filesystem view.
    #[default]
    Direct,
    /// The control process runs inside a container; only the listed
    /// prefixes exist on the host.
    Nested(Vec<PathMapping>),
}

impl HostPaths {
    /// `Direct` when no mappings are given, `Nested` otherwise.
    pub fn from_mappings(mappings: Vec<PathMapping>) -> Self {
        if mappings.is_empty() {
            HostPaths::Direct
        } else {
            HostPaths::Nested(mappings)
        }
    }

    /// Translates a control path for the container engine.
    pub fn to_host(&self, control: &Path) -> Result<PathBuf> {
        let normal = normalized(control).ok_or_else(|| Error::InvalidPath(control.to_path_buf()))?;
        match self {
            HostPaths::Direct => Ok(normal),
            HostPaths::Nested(mappings) => mappings
                .iter()
                .filter_map(|m| {
                    let rest = normal.strip_prefix(&m.control).ok()?;
                    Some((m.control.components().count(), join_rest(&m.host, rest)))
                })
                .max_by_key(|(depth, _)| *depth)
                .map(|(_, path)| path)
                .ok_or(Error::PathNotMapped(normal)),
        }
    }
}

fn join_rest(base: &Path, rest: &Path) -> PathBuf {
    if rest.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}

/// Absolute path with `.` removed. `None` for relative paths or any `..`.
fn normalized(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return None,
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SandboxKey;
    use crate::sanitizer::Sanitizer;

    fn layout() -> SandboxLayout {
        SandboxLayout::new(
            Path::new("/ws"),
            &SandboxKey::baseline(Sanitizer::Address),
            "mruby",
        )
    }

    #[test]
    fn build_table_maps_fixed_worker_locations() {
        let layout = layout();
        let table = MountTable::for_build(&layout).unwrap();

        assert_eq!(
            table.to_worker_path(&layout.source().join("src/vm.c")),
            Some(PathBuf::from("/src/mruby/src/vm.c"))
        );
        assert_eq!(
            table.to_worker_path(&layout.out().join("mruby_fuzzer")),
            Some(PathBuf::from("/out/mruby_fuzzer"))
        );
        assert_eq!(table.to_worker_path(layout.work()), Some(PathBuf::from("/work")));
    }

    #[test]
    fn unlisted_paths_are_not_visible() {
        let table = MountTable::for_build(&layout()).unwrap();

        assert_eq!(table.to_worker_path(Path::new("/ws/immutable/mruby")), None);
        assert_eq!(table.to_control_path(Path::new("/testcase")), None);
        assert_eq!(table.to_worker_path(Path::new("relative/path")), None);
    }

    #[test]
    fn parent_components_are_rejected() {
        let layout = layout();
        let table = MountTable::for_build(&layout).unwrap();
        let escaped = layout.source().join("../../immutable");
        assert_eq!(table.to_worker_path(&escaped), None);
    }

    #[test]
    fn translation_round_trips_through_the_table() {
        let layout = layout();
        let table = MountTable::for_reproduce(&layout, Path::new("/ws/x/poc.bin")).unwrap();
        let control = layout.out().join("fuzzer.dict");

        let worker = to_worker_path(&control, &table).unwrap();
        assert_eq!(to_control_path(&worker, &table), Some(control));
        assert_eq!(
            table.to_control_path(Path::new("/testcase")),
            Some(PathBuf::from("/ws/x/poc.bin"))
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = MountTable::new();
        table
            .push("/a".into(), "/outer".into(), MountMode::ReadOnly)
            .unwrap();
        table
            .push("/a/b".into(), "/inner".into(), MountMode::ReadWrite)
            .unwrap();

        assert_eq!(
            table.to_worker_path(Path::new("/a/b/c")),
            Some(PathBuf::from("/inner/c"))
        );
        assert_eq!(
            table.to_worker_path(Path::new("/a/x")),
            Some(PathBuf::from("/outer/x"))
        );
    }

    #[test]
    fn duplicate_worker_targets_are_rejected() {
        let mut table = MountTable::new();
        table
            .push("/a".into(), "/out".into(), MountMode::ReadOnly)
            .unwrap();
        assert!(table
            .push("/b".into(), "/out".into(), MountMode::ReadOnly)
            .is_err());
        assert!(table
            .push("rel".into(), "/x".into(), MountMode::ReadOnly)
            .is_err());
    }

    #[test]
    fn resolve_token_rewrites_only_mapped_paths() {
        let layout = layout();
        let table = MountTable::for_reproduce(&layout, Path::new("/pocs/crash-1")).unwrap();

        assert_eq!(table.resolve_token("/testcase"), "/pocs/crash-1");
        assert_eq!(table.resolve_token("-runs=100"), "-runs=100");
        assert_eq!(table.resolve_token("/usr/bin/gdb"), "/usr/bin/gdb");
    }

    #[test]
    fn direct_host_paths_pass_through() {
        let hosts = HostPaths::from_mappings(vec![]);
        assert_eq!(hosts, HostPaths::Direct);
        assert_eq!(
            hosts.to_host(Path::new("/ws/./a")).unwrap(),
            PathBuf::from("/ws/a")
        );
    }

    #[test]
    fn nested_host_paths_never_fall_back() {
        let hosts = HostPaths::from_mappings(vec![PathMapping {
            control: "/workspace".into(),
            host: "/home/ci/agent-workspace".into(),
        }]);

        assert_eq!(
            hosts.to_host(Path::new("/workspace/task/src")).unwrap(),
            PathBuf::from("/home/ci/agent-workspace/task/src")
        );
        assert!(matches!(
            hosts.to_host(Path::new("/tmp/other")),
            Err(Error::PathNotMapped(_))
        ));
    }
}
