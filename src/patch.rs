//! Candidate source modifications.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One `@@ ... @@` hunk of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// File the hunk applies to, relative to the source root.
    pub file: PathBuf,
    /// The `@@ -a,b +c,d @@` header line.
    pub header: String,
}

/// A unified diff, or the empty baseline.
///
/// Whitespace-only text is treated as the baseline, since it cannot be
/// applied and modifies nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(String);

impl Patch {
    /// Creates a patch from diff text.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.trim().is_empty() {
            Self::baseline()
        } else {
            Self(text)
        }
    }

    /// The "no modification" patch.
    pub fn baseline() -> Self {
        Self(String::new())
    }

    /// Returns true for the empty patch.
    pub fn is_baseline(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the diff text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the diff text as bytes, the form that is hashed.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Hunks in the order they appear in the diff.
    pub fn hunks(&self) -> Vec<Hunk> {
        let mut hunks = Vec::new();
        let mut current: Option<PathBuf> = None;

        for line in self.0.lines() {
            if let Some(target) = line.strip_prefix("+++ ") {
                current = parse_diff_path(target);
            } else if line.starts_with("@@") {
                if let Some(file) = &current {
                    hunks.push(Hunk {
                        file: file.clone(),
                        header: line.to_string(),
                    });
                }
            }
        }

        hunks
    }

    /// Files touched by the patch, deduplicated, in diff order.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();
        for hunk in self.hunks() {
            if !files.contains(&hunk.file) {
                files.push(hunk.file);
            }
        }
        files
    }
}

impl From<&str> for Patch {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Patch {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Strips the `b/` prefix and trailing timestamp from a `+++` target.
fn parse_diff_path(target: &str) -> Option<PathBuf> {
    let path = target.split('\t').next().unwrap_or(target).trim();
    if path == "/dev/null" {
        return None;
    }
    let path = path.strip_prefix("b/").unwrap_or(path);
    Some(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILES: &str = "\
diff --git a/src/parse.c b/src/parse.c
--- a/src/parse.c
+++ b/src/parse.c
@@ -10,7 +10,7 @@ int parse(char *buf) {
-    char tmp[8];
+    char tmp[16];
@@ -40,3 +40,4 @@ int parse(char *buf) {
+    free(tmp);
diff --git a/include/parse.h b/include/parse.h
--- a/include/parse.h
+++ b/include/parse.h\t2024-01-01 00:00:00
@@ -1,1 +1,2 @@
+#define LIMIT 16
";

    #[test]
    fn whitespace_only_is_baseline() {
        assert!(Patch::new("  \n\t").is_baseline());
        assert_eq!(Patch::new("\n"), Patch::baseline());
        assert!(!Patch::new(TWO_FILES).is_baseline());
    }

    #[test]
    fn hunks_are_listed_in_order() {
        let hunks = Patch::new(TWO_FILES).hunks();

        assert_eq!(hunks.len(), 3);
        assert_eq!(hunks[0].file, PathBuf::from("src/parse.c"));
        assert!(hunks[1].header.starts_with("@@ -40,3"));
        assert_eq!(hunks[2].file, PathBuf::from("include/parse.h"));
    }

    #[test]
    fn files_are_deduplicated() {
        let files = Patch::new(TWO_FILES).files();
        assert_eq!(
            files,
            vec![PathBuf::from("src/parse.c"), PathBuf::from("include/parse.h")]
        );
    }

    #[test]
    fn deleted_files_have_no_hunk_target() {
        let patch = Patch::new("--- a/old.c\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n");
        assert!(patch.hunks().is_empty());
    }
}
