//! Thin async wrapper around external command-line tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Captured result of a finished tool invocation.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stderr if non-empty, otherwise stdout, trimmed.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Builder for one external command.
pub(crate) struct Tool {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(String, OsString)>,
    stdin: Option<Vec<u8>>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: &[u8]) -> Self {
        self.stdin = Some(input.to_vec());
        self
    }

    /// Runs the command to completion. A non-zero exit is not an error here;
    /// failing to start the program is.
    pub async fn output(self) -> Result<ToolOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to run {}: {}", self.program, e),
            ))
        })?;

        let writer = match (self.stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
                // A tool may exit before reading all input; that shows up in
                // its exit status, not here.
                let _ = pipe.write_all(&input).await;
            })),
            _ => None,
        };

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        tracing::debug!(
            program = %self.program,
            status = ?output.status.code(),
            "tool finished"
        );

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Recursively copies `src` to `dst` with `cp -a`, preserving symlinks and
/// modes. `dst` must not exist.
pub(crate) async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let output = Tool::new("cp").arg("-a").arg(src).arg(dst).output().await?;
    if !output.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "cp -a {} {} failed: {}",
            src.display(),
            dst.display(),
            output.diagnostics()
        ))));
    }
    Ok(())
}

/// Removes a directory tree; a missing tree is not an error.
pub(crate) async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn tool_captures_output_and_status() {
        let out = Tool::new("sh")
            .args(["-c", "echo hi; echo oops >&2; exit 3"])
            .output()
            .await
            .unwrap();

        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.diagnostics(), "oops");
    }

    #[tokio::test]
    async fn tool_feeds_stdin() {
        let out = Tool::new("cat").stdin(b"payload").output().await.unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let result = Tool::new("definitely-not-a-real-tool-xyz").output().await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn copy_tree_preserves_nested_files() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("a/b/file.txt"), "content").unwrap();

        let dst = temp.path().join("nested/dst");
        copy_tree(&src, &dst).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dst.join("a/b/file.txt")).unwrap(),
            "content"
        );
    }

    #[tokio::test]
    async fn remove_tree_ignores_missing_paths() {
        let temp = TempDir::new().unwrap();
        remove_tree(&temp.path().join("absent")).await.unwrap();
    }
}
