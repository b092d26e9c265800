//! Git operations on source mirrors.

use std::path::Path;

use crate::error::{Error, Result};
use crate::patch::Patch;
use crate::tool::{Tool, ToolOutput};

/// Outcome of applying a patch to a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    Applied,
    /// The hunks do not apply; holds the tool's diagnostics.
    Rejected(String),
}

fn git(dir: &Path) -> Tool {
    Tool::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=patch-sandbox"])
        .args(["-c", "user.email=patch-sandbox@localhost"])
        .args(["-c", "commit.gpgsign=false"])
}

fn check(output: ToolOutput, what: &str) -> Result<ToolOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(Error::Git(format!("{} failed: {}", what, output.diagnostics())))
    }
}

/// Turns a plain copy of the source into a fresh single-commit repository.
///
/// Any pre-existing `.git` is discarded so the mirror's history is exactly
/// the pristine tree. Ignored files are committed too, so `clean -fdx`
/// never removes pristine content.
pub(crate) async fn init_mirror(dir: &Path) -> Result<()> {
    let dot_git = dir.join(".git");
    if dot_git.is_dir() {
        tokio::fs::remove_dir_all(&dot_git).await?;
    } else if dot_git.exists() {
        tokio::fs::remove_file(&dot_git).await?;
    }

    check(git(dir).args(["init", "-q"]).output().await?, "git init")?;
    check(
        git(dir).args(["add", "--all", "--force"]).output().await?,
        "git add",
    )?;
    check(
        git(dir)
            .args(["commit", "-q", "--allow-empty", "-m", "Initial commit"])
            .output()
            .await?,
        "git commit",
    )?;

    tracing::debug!(path = ?dir, "initialized git mirror");
    Ok(())
}

/// Restores the mirror to its initial commit.
pub(crate) async fn reset(dir: &Path) -> Result<()> {
    check(
        git(dir).args(["reset", "-q", "--hard"]).output().await?,
        "git reset",
    )?;
    check(
        git(dir).args(["clean", "-q", "-fdx"]).output().await?,
        "git clean",
    )?;
    Ok(())
}

/// Applies `patch` to the working tree at `dir` with `git apply`.
///
/// Repository discovery is fenced at `dir`'s parent, so a plain directory
/// is patched relative to itself even when it sits inside another
/// repository.
pub(crate) async fn apply(dir: &Path, patch: &Patch, check_only: bool) -> Result<ApplyOutcome> {
    if patch.is_baseline() {
        return Ok(ApplyOutcome::Applied);
    }

    let mut tool = git(dir).args(["apply", "--whitespace=nowarn"]);
    if check_only {
        tool = tool.arg("--check");
    }
    if let Some(parent) = dir.parent() {
        tool = tool.env("GIT_CEILING_DIRECTORIES", parent);
    }

    let output = tool.stdin(patch.as_bytes()).output().await?;
    if output.success() {
        Ok(ApplyOutcome::Applied)
    } else {
        Ok(ApplyOutcome::Rejected(output.diagnostics()))
    }
}

/// Applies `patch` with `patch -F 3`, tolerating fuzzy context.
pub(crate) async fn fuzzy_apply(dir: &Path, patch: &Patch) -> Result<ApplyOutcome> {
    if patch.is_baseline() {
        return Ok(ApplyOutcome::Applied);
    }

    let output = Tool::new("patch")
        .current_dir(dir)
        .args(["-F", "3", "--no-backup-if-mismatch", "--batch", "-p1"])
        .stdin(patch.as_bytes())
        .output()
        .await?;
    if output.success() {
        Ok(ApplyOutcome::Applied)
    } else {
        Ok(ApplyOutcome::Rejected(output.diagnostics()))
    }
}

/// Working-tree diff against the initial commit, including new files.
pub(crate) async fn diff(dir: &Path) -> Result<String> {
    check(
        git(dir).args(["add", "--all", "--intent-to-add"]).output().await?,
        "git add -N",
    )?;
    let output = check(git(dir).arg("diff").output().await?, "git diff")?;
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_tree() -> TempDir {
        let temp = TempDir::new().expect("failed to create temp dir");
        std::fs::write(temp.path().join("main.c"), "int main() {\n    return 0;\n}\n")
            .expect("failed to write main.c");
        temp
    }

    const FIX: &str = "\
--- a/main.c
+++ b/main.c
@@ -1,3 +1,3 @@
 int main() {
-    return 0;
+    return 1;
 }
";

    #[tokio::test]
    async fn mirror_is_committed_and_resettable() {
        let tree = source_tree();
        init_mirror(tree.path()).await.unwrap();
        assert!(tree.path().join(".git").is_dir());

        std::fs::write(tree.path().join("main.c"), "garbage").unwrap();
        std::fs::write(tree.path().join("extra.o"), "obj").unwrap();
        reset(tree.path()).await.unwrap();

        let main = std::fs::read_to_string(tree.path().join("main.c")).unwrap();
        assert!(main.contains("return 0"));
        assert!(!tree.path().join("extra.o").exists());
    }

    #[tokio::test]
    async fn apply_reports_rejections_separately() {
        let tree = source_tree();

        let bad = Patch::new(FIX.replace("return 0", "return 42"));
        match apply(tree.path(), &bad, false).await.unwrap() {
            ApplyOutcome::Rejected(reason) => assert!(!reason.is_empty()),
            ApplyOutcome::Applied => panic!("mismatched patch must not apply"),
        }

        let good = Patch::new(FIX);
        assert_eq!(
            apply(tree.path(), &good, true).await.unwrap(),
            ApplyOutcome::Applied
        );
        let main = std::fs::read_to_string(tree.path().join("main.c")).unwrap();
        assert!(main.contains("return 0"), "--check must not modify files");

        assert_eq!(
            apply(tree.path(), &good, false).await.unwrap(),
            ApplyOutcome::Applied
        );
        let main = std::fs::read_to_string(tree.path().join("main.c")).unwrap();
        assert!(main.contains("return 1"));
    }

    #[tokio::test]
    async fn diff_reflects_working_tree_changes() {
        let tree = source_tree();
        init_mirror(tree.path()).await.unwrap();

        assert_eq!(
            apply(tree.path(), &Patch::new(FIX), false).await.unwrap(),
            ApplyOutcome::Applied
        );
        let diff = diff(tree.path()).await.unwrap();
        assert!(diff.contains("+    return 1;"));
    }
}
