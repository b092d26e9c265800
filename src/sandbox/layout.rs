//! On-disk layout of one sandbox.

use std::path::{Path, PathBuf};

use crate::identity::SandboxKey;

/// Marker written once the patched source is in place. Holds the key.
const MATERIALIZED_MARKER: &str = ".materialized";

/// Marker written after a successful build. Holds the patch text.
const BUILD_MARKER: &str = ".build";

/// Paths of one sandbox subtree, in the control-process namespace.
///
/// ```text
/// <workspace>/<key>/
///     <project>/              patched source
///     build/out/<project>/    artifacts
///     build/work/             scratch
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    key: SandboxKey,
    project: String,
    root: PathBuf,
    source: PathBuf,
    out: PathBuf,
    work: PathBuf,
}

impl SandboxLayout {
    /// Computes the layout for `key` inside `workspace_root`.
    pub fn new(workspace_root: &Path, key: &SandboxKey, project: &str) -> Self {
        let root = workspace_root.join(key.as_str());
        Self {
            key: key.clone(),
            project: project.to_string(),
            source: root.join(project),
            out: root.join("build").join("out").join(project),
            work: root.join("build").join("work"),
            root,
        }
    }

    /// Identity this sandbox belongs to.
    pub fn key(&self) -> &SandboxKey {
        &self.key
    }

    /// Project directory name under `src/`.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The sandbox directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Patched source tree.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Build artifacts.
    pub fn out(&self) -> &Path {
        &self.out
    }

    /// Scratch space.
    pub fn work(&self) -> &Path {
        &self.work
    }

    /// Present once the source tree is complete.
    pub fn materialized_marker(&self) -> PathBuf {
        self.root.join(MATERIALIZED_MARKER)
    }

    /// Present once a build succeeded; holds the patch it was built from.
    pub fn build_marker(&self) -> PathBuf {
        self.root.join(BUILD_MARKER)
    }

    /// Returns true once a build of this sandbox has succeeded.
    pub fn is_built(&self) -> bool {
        self.build_marker().is_file()
    }

    /// A fresh, private staging directory under the sandbox root.
    pub(crate) fn new_staging_dir(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.root.join(format!(".staging-{}", &id[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::Sanitizer;

    #[test]
    fn layout_follows_workspace_contract() {
        let key = SandboxKey::baseline(Sanitizer::Address);
        let layout = SandboxLayout::new(Path::new("/ws"), &key, "mruby");

        let root = PathBuf::from("/ws").join(key.as_str());
        assert_eq!(layout.root(), root);
        assert_eq!(layout.source(), root.join("mruby"));
        assert_eq!(layout.out(), root.join("build/out/mruby"));
        assert_eq!(layout.work(), root.join("build/work"));
        assert_eq!(layout.build_marker(), root.join(".build"));
    }

    #[test]
    fn staging_dirs_are_unique_and_inside_root() {
        let key = SandboxKey::baseline(Sanitizer::Memory);
        let layout = SandboxLayout::new(Path::new("/ws"), &key, "p");

        let a = layout.new_staging_dir();
        let b = layout.new_staging_dir();
        assert_ne!(a, b);
        assert!(a.starts_with(layout.root()));
    }
}
