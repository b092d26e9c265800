//! Produces (or reuses) the patched source tree of a sandbox.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patch::Patch;
use crate::tool::{copy_tree, remove_tree};
use crate::workspace::SandboxLease;

use super::git::{self, ApplyOutcome};
use super::layout::SandboxLayout;

/// What `materialize` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// The source was copied and patched now.
    Created,
    /// The sandbox already held this identity; nothing was touched.
    Reused,
}

/// Ensures the sandbox behind `lease` holds `source_mirror` with `patch`
/// applied.
///
/// The patched tree is assembled in a private staging directory and moved
/// into place only once the patch has applied, so a failed call never
/// leaves a half-patched source behind. Idempotence is decided by the
/// identity marker, not by re-diffing.
pub async fn materialize(
    lease: &SandboxLease,
    source_mirror: &Path,
    patch: &Patch,
) -> Result<Materialization> {
    let layout = lease.layout();
    let key = layout.key();

    if is_materialized(layout).await {
        tracing::debug!(identity = %key, "sandbox already materialized");
        return Ok(Materialization::Reused);
    }

    tracing::info!(
        identity = %key,
        files = patch.files().len(),
        "materializing sandbox"
    );

    tokio::fs::create_dir_all(layout.root())
        .await
        .map_err(|e| Error::from(e).in_sandbox(key))?;
    // Leftovers from an interrupted attempt are never trusted.
    remove_tree(layout.source())
        .await
        .map_err(|e| e.in_sandbox(key))?;

    let staging = layout.new_staging_dir();
    let result = stage_and_apply(layout, &staging, source_mirror, patch).await;
    if let Err(e) = remove_tree(&staging).await {
        tracing::warn!(path = ?staging, error = %e, "failed to remove staging directory");
    }
    result?;

    tokio::fs::create_dir_all(layout.out())
        .await
        .map_err(|e| Error::from(e).in_sandbox(key))?;
    tokio::fs::create_dir_all(layout.work())
        .await
        .map_err(|e| Error::from(e).in_sandbox(key))?;
    tokio::fs::write(layout.materialized_marker(), key.as_str())
        .await
        .map_err(|e| Error::from(e).in_sandbox(key))?;

    tracing::info!(identity = %key, path = ?layout.source(), "sandbox materialized");
    Ok(Materialization::Created)
}

async fn is_materialized(layout: &SandboxLayout) -> bool {
    match tokio::fs::read_to_string(layout.materialized_marker()).await {
        Ok(content) => content.trim() == layout.key().as_str() && layout.source().is_dir(),
        Err(_) => false,
    }
}

async fn stage_and_apply(
    layout: &SandboxLayout,
    staging: &Path,
    source_mirror: &Path,
    patch: &Patch,
) -> Result<()> {
    let key = layout.key();
    let staged_source = staging.join(layout.project());

    copy_tree(source_mirror, &staged_source)
        .await
        .map_err(|e| e.in_sandbox(key))?;

    match git::apply(&staged_source, patch, false)
        .await
        .map_err(|e| e.in_sandbox(key))?
    {
        ApplyOutcome::Applied => {}
        ApplyOutcome::Rejected(reason) => {
            tracing::warn!(identity = %key, reason = %reason, "patch does not apply");
            return Err(Error::PatchApplication {
                identity: key.clone(),
                reason,
            });
        }
    }

    tokio::fs::rename(&staged_source, layout.source())
        .await
        .map_err(|e| Error::from(e).in_sandbox(key))?;
    Ok(())
}
