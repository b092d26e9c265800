//! Error types for sandbox orchestration.
//!
//! Only infrastructure problems and patches that do not apply are errors.
//! Build failures, timeouts and crashes are ordinary [`Verdict`](crate::Verdict)
//! values.

use std::path::PathBuf;
use thiserror::Error;

use crate::identity::SandboxKey;

/// Coarse classification used by callers to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Storage, permissions, execution backend. Retry manually.
    Infrastructure,
    /// The patch does not apply against the pristine source.
    PatchApplication,
}

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The task workspace could not be created or torn down.
    #[error("workspace error at {path}: {reason}")]
    Workspace { path: PathBuf, reason: String },

    /// Git operation on a mirror failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The sandbox path is not valid.
    #[error("invalid sandbox path: {0}")]
    InvalidPath(PathBuf),

    /// A control-process path has no counterpart in the host namespace.
    #[error("path {0} is not covered by any host path mapping")]
    PathNotMapped(PathBuf),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The execution backend rejected or lost a worker.
    #[error("execution backend error: {0}")]
    Backend(String),

    /// The execution backend itself cannot be reached.
    #[error("execution backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The patch does not apply against the mirror state.
    #[error("patch for sandbox {identity} does not apply: {reason}")]
    PatchApplication { identity: SandboxKey, reason: String },

    /// The proof-of-concept file is missing or unreadable.
    #[error("proof of concept not found: {0}")]
    MissingPoc(PathBuf),

    /// The task is closing and accepts no new sandbox requests.
    #[error("task is closed")]
    TaskClosed,

    /// An infrastructure error raised while working on one sandbox.
    #[error("sandbox {identity}: {source}")]
    Sandbox {
        identity: SandboxKey,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PatchApplication { .. } => ErrorKind::PatchApplication,
            Error::Sandbox { source, .. } => source.kind(),
            _ => ErrorKind::Infrastructure,
        }
    }

    /// Returns true if the patch itself is at fault.
    pub fn is_patch_error(&self) -> bool {
        self.kind() == ErrorKind::PatchApplication
    }

    /// Returns the sandbox identity this error is attached to, if any.
    pub fn identity(&self) -> Option<&SandboxKey> {
        match self {
            Error::PatchApplication { identity, .. } | Error::Sandbox { identity, .. } => {
                Some(identity)
            }
            _ => None,
        }
    }

    /// Attaches a sandbox identity, unless the error already carries one.
    pub fn in_sandbox(self, identity: &SandboxKey) -> Error {
        if self.identity().is_some() {
            return self;
        }
        Error::Sandbox {
            identity: identity.clone(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::sanitizer::Sanitizer;

    #[test]
    fn patch_errors_keep_their_kind_when_wrapped() {
        let key = SandboxKey::baseline(Sanitizer::Address);
        let err = Error::PatchApplication {
            identity: key.clone(),
            reason: "hunk #1 failed".to_string(),
        };
        assert!(err.is_patch_error());
        assert!(err.in_sandbox(&key).is_patch_error());
    }

    #[test]
    fn in_sandbox_attaches_identity_once() {
        let first = crate::identity::identity(&Patch::new("a"), Sanitizer::Memory);
        let second = SandboxKey::baseline(Sanitizer::Memory);

        let err = Error::Backend("boom".to_string())
            .in_sandbox(&first)
            .in_sandbox(&second);

        assert_eq!(err.identity(), Some(&first));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.to_string().contains("boom"));
    }
}
