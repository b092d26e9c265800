//! Optional build tooling overlays.
//!
//! Compile interception copies a `bear` shim into the sandbox source so the
//! build emits `compile_commands.json` as a side effect. Nothing here may
//! fail a build; problems are reported as [`ToolingStatus::Unavailable`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::worker_source_dir;
use crate::sandbox::SandboxLayout;
use crate::tool::{copy_tree, remove_tree};

/// Interception entry point every asset set must contain.
pub const SHIM_NAME: &str = "bear.sh";

/// Directory the assets are copied to, inside the sandbox source.
pub const ASSET_DIR: &str = ".bear";

/// Compilation log produced by the shim, in the artifact directory.
pub const COMPILE_LOG: &str = "compile_commands.json";

/// Worker working directory recorded by the shim.
const PWD_FILE: &str = ".pwd";

const DEBUG_FLAGS: [&str; 2] = [
    r#"export CFLAGS="$CFLAGS -O0 -g3""#,
    r#"export CXXFLAGS="$CXXFLAGS -O0 -g3""#,
];

/// Whether a compilation log will be available for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum ToolingStatus {
    NotRequested,
    Injected,
    /// Injection was requested but failed; no log will be produced.
    Unavailable(String),
}

/// Result of a successful injection.
#[derive(Debug, Clone)]
pub struct InjectedTooling {
    /// Where the assets were copied (control path).
    pub assets: PathBuf,
    /// The shim as the worker sees it.
    pub entry_point: PathBuf,
}

/// Copies the interception assets into `<source>/.bear`.
pub async fn inject_compile_interception(
    layout: &SandboxLayout,
    assets_dir: &Path,
) -> Result<InjectedTooling> {
    if !assets_dir.join(SHIM_NAME).is_file() {
        return Err(Error::Config(format!(
            "{} has no {}",
            assets_dir.display(),
            SHIM_NAME
        )));
    }

    let target = layout.source().join(ASSET_DIR);
    remove_tree(&target).await?;
    copy_tree(assets_dir, &target).await?;

    tracing::info!(identity = %layout.key(), path = ?target, "compile interception injected");
    Ok(InjectedTooling {
        assets: target,
        entry_point: worker_source_dir(layout.project())
            .join(ASSET_DIR)
            .join(SHIM_NAME),
    })
}

/// Makes the compilation log usable from the control process.
///
/// Worker working-directory paths are rewritten to the sandbox source and
/// the log is copied into the source root. A missing log becomes `[]`.
/// Returns the copy in the source root.
pub async fn finalize_compile_log(layout: &SandboxLayout) -> Result<PathBuf> {
    let log = layout.out().join(COMPILE_LOG);
    let pwd = layout.out().join(PWD_FILE);

    let content = if log.is_file() && pwd.is_file() {
        let workdir = tokio::fs::read_to_string(&pwd).await?;
        let workdir = workdir.trim();
        let raw = tokio::fs::read_to_string(&log).await?;
        if workdir.is_empty() {
            raw
        } else {
            raw.replace(workdir, &layout.source().display().to_string())
        }
    } else {
        tracing::warn!(identity = %layout.key(), "build produced no compile log");
        "[]".to_string()
    };

    if content.trim() == "[]" {
        tracing::warn!(identity = %layout.key(), "compile_commands.json is empty");
    }
    tokio::fs::write(&log, &content).await?;

    let target = layout.source().join(COMPILE_LOG);
    tokio::fs::write(&target, &content).await?;
    Ok(target)
}

/// Adds `-O0 -g3` to a build script, right after its shebang.
///
/// Returns false (with a warning) when the script does not exist. Running
/// it twice changes nothing.
pub async fn inject_debug_flags(build_script: &Path) -> Result<bool> {
    if !build_script.is_file() {
        tracing::warn!(path = ?build_script, "build script not found, skipping debug flags");
        return Ok(false);
    }

    let content = tokio::fs::read_to_string(build_script).await?;
    if content.contains(DEBUG_FLAGS[0]) {
        return Ok(true);
    }

    let mut lines: Vec<&str> = content.lines().collect();
    let at = match lines.first() {
        Some(first) if first.starts_with("#!") => 1,
        _ => 0,
    };
    for (offset, flag) in DEBUG_FLAGS.iter().enumerate() {
        lines.insert(at + offset, *flag);
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    tokio::fs::write(build_script, updated).await?;

    tracing::info!(path = ?build_script, "debug flags injected");
    Ok(true)
}
