//! Content-addressed sandbox identities.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::patch::Patch;
use crate::sanitizer::Sanitizer;

/// Deterministic key for one (patch, sanitizer) pair.
///
/// Formatted as `<sha256-hex>-<sanitizer-tag>`; only lowercase hex, ASCII
/// letters and `-`, so it is usable as a directory and container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxKey(String);

impl SandboxKey {
    /// Key of the unmodified source under `sanitizer`.
    pub fn baseline(sanitizer: Sanitizer) -> Self {
        identity(&Patch::baseline(), sanitizer)
    }

    /// Returns the full key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines and container names. Shorter
    /// keys are returned whole.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SandboxKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives the sandbox key for `patch` built under `sanitizer`.
///
/// The digest covers the patch bytes, a NUL separator and the sanitizer tag.
pub fn identity(patch: &Patch, sanitizer: Sanitizer) -> SandboxKey {
    let mut hasher = Sha256::new();
    hasher.update(patch.as_bytes());
    hasher.update([0u8]);
    hasher.update(sanitizer.tag().as_bytes());
    SandboxKey(format!(
        "{}-{}",
        hex::encode(hasher.finalize()),
        sanitizer.tag()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_deterministic() {
        let patch = Patch::new("--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n");
        assert_eq!(
            identity(&patch, Sanitizer::Address),
            identity(&patch.clone(), Sanitizer::Address)
        );
    }

    #[test]
    fn distinct_patches_get_distinct_keys() {
        let a = Patch::new("+a\n");
        let b = Patch::new("+b\n");
        assert_ne!(
            identity(&a, Sanitizer::Address),
            identity(&b, Sanitizer::Address)
        );
    }

    #[test]
    fn distinct_sanitizers_get_distinct_keys() {
        let patch = Patch::new("+a\n");
        let mut keys: Vec<_> = Sanitizer::ALL
            .iter()
            .map(|s| identity(&patch, *s))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), Sanitizer::ALL.len());
    }

    #[test]
    fn baseline_is_stable_and_distinct() {
        let baseline = SandboxKey::baseline(Sanitizer::Address);
        assert_eq!(baseline, identity(&Patch::new(""), Sanitizer::Address));
        assert_ne!(baseline, identity(&Patch::new("+x\n"), Sanitizer::Address));
        assert!(baseline.as_str().ends_with("-address"));
    }

    #[test]
    fn key_is_filesystem_safe() {
        let key = identity(&Patch::new("../../etc/passwd\n"), Sanitizer::UndefinedBehavior);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(key.as_str().len(), 64 + 1 + "undefined".len());
        assert_eq!(key.short().len(), 12);
    }

    #[test]
    fn short_tolerates_short_keys() {
        let key: SandboxKey = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(key.short(), "abc");

        let full = SandboxKey::baseline(Sanitizer::Address);
        assert_eq!(full.short().len(), 12);
        assert!(full.as_str().starts_with(full.short()));
    }
}
