//! Docker CLI backend.
//!
//! Workers are created with `docker create` and attached with
//! `docker start -a`, so the container exists (and can be killed and
//! removed by name) independently of the attached client process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::identity::SandboxKey;
use crate::paths::{HostPaths, MountMode};
use crate::retry::RetryPolicy;
use crate::tool::{Tool, ToolOutput};

use super::{
    ExecutionBackend, LaunchSpec, WorkerExit, WorkerHandle, WorkerLogs, DAEMON_ERROR,
    DOCKER_FAILURE_EXIT, IDENTITY_LABEL,
};

/// Runs workers as docker containers.
#[derive(Debug)]
pub struct DockerBackend {
    docker: String,
    host_paths: HostPaths,
    retry: RetryPolicy,
    attached: Mutex<HashMap<String, Child>>,
}

impl DockerBackend {
    pub fn new(host_paths: HostPaths) -> Self {
        Self {
            docker: "docker".to_string(),
            host_paths,
            retry: RetryPolicy::default(),
            attached: Mutex::new(HashMap::new()),
        }
    }

    /// Uses a different docker-compatible CLI (e.g. `podman`).
    pub fn with_cli(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns true if the docker daemon answers.
    pub async fn is_available(&self) -> bool {
        match Tool::new(&self.docker)
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
        {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, spec: &LaunchSpec) -> Result<Vec<String>> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            format!("{}={}", IDENTITY_LABEL, spec.identity),
            "--shm-size=2g".to_string(),
        ];
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in spec.mounts.mounts() {
            let host = self.host_paths.to_host(&mount.control)?;
            let mut volume = format!("{}:{}", host.display(), mount.worker.display());
            if mount.mode == MountMode::ReadOnly {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        Ok(args)
    }

    async fn docker(&self, args: &[&str]) -> Result<ToolOutput> {
        Tool::new(&self.docker).args(args).output().await
    }

    fn take_attached(&self, name: &str) -> Option<Child> {
        self.attached
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
    }
}

fn backend_error(what: &str, output: &ToolOutput) -> Error {
    let diagnostics = output.diagnostics();
    if output.status.code() == Some(DOCKER_FAILURE_EXIT)
        || diagnostics.contains(DAEMON_ERROR)
        || diagnostics.contains("Cannot connect to the Docker daemon")
    {
        Error::BackendUnavailable(format!("{}: {}", what, diagnostics))
    } else {
        Error::Backend(format!("{}: {}", what, diagnostics))
    }
}

/// One captured line without its terminator; invalid UTF-8 is replaced.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn is_missing(output: &ToolOutput) -> bool {
    let diagnostics = output.diagnostics();
    diagnostics.contains("No such container") || diagnostics.contains("is not running")
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare_image(&self, local: &str, remote: Option<&str>) -> Result<()> {
        let Some(remote) = remote else {
            return Ok(());
        };
        tracing::info!(remote = %remote, local = %local, "pulling worker image");

        self.retry
            .run("docker pull", || async move {
                let pulled = self.docker(&["pull", remote]).await?;
                if !pulled.success() {
                    return Err(backend_error("docker pull", &pulled));
                }
                let tagged = self.docker(&["tag", remote, local]).await?;
                if !tagged.success() {
                    return Err(backend_error("docker tag", &tagged));
                }
                Ok(())
            })
            .await
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle> {
        let args = self.create_args(spec)?;
        crate::debug::debug_command(&self.docker, &args);

        let created = Tool::new(&self.docker).args(&args).output().await?;
        if !created.success() {
            return Err(backend_error("docker create", &created));
        }

        let attach = Command::new(&self.docker)
            .args(["start", "-a", spec.name.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match attach {
            Ok(child) => child,
            Err(e) => {
                // The container exists but nobody owns it yet.
                let _ = self.docker(&["rm", "-f", spec.name.as_str()]).await;
                return Err(Error::Backend(format!(
                    "failed to attach to {}: {}",
                    spec.name, e
                )));
            }
        };

        tracing::info!(
            worker = %spec.name,
            image = %spec.image,
            identity = %spec.identity,
            "worker started"
        );

        self.attached
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(spec.name.clone(), child);
        Ok(WorkerHandle {
            name: spec.name.clone(),
        })
    }

    async fn wait(&self, worker: &WorkerHandle) -> Result<WorkerExit> {
        let mut child = self
            .take_attached(&worker.name)
            .ok_or_else(|| Error::Backend(format!("worker {} is not attached", worker.name)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Backend("worker stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Backend("worker stderr was not piped".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout);
        let mut stderr_reader = BufReader::new(stderr);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut logs = WorkerLogs::default();
        let mut stdout_open = true;
        let mut stderr_open = true;

        // Workers echo raw input bytes, so lines are read as bytes and
        // decoded lossily. Only EOF or an I/O error closes a stream.
        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout_reader.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                    match read {
                        Ok(0) => stdout_open = false,
                        Ok(_) => {
                            let line = decode_line(&stdout_buf);
                            tracing::debug!(worker = %worker.name, line = %line, "worker stdout");
                            logs.stdout.push_str(&line);
                            logs.stdout.push('\n');
                            stdout_buf.clear();
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "error reading worker stdout");
                            stdout_open = false;
                        }
                    }
                }
                read = stderr_reader.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                    match read {
                        Ok(0) => stderr_open = false,
                        Ok(_) => {
                            let line = decode_line(&stderr_buf);
                            tracing::debug!(worker = %worker.name, line = %line, "worker stderr");
                            logs.stderr.push_str(&line);
                            logs.stderr.push('\n');
                            stderr_buf.clear();
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "error reading worker stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Backend(format!("failed to wait for {}: {}", worker.name, e)))?;

        tracing::info!(worker = %worker.name, code = ?status.code(), "worker exited");
        Ok(WorkerExit {
            code: status.code(),
            logs,
        })
    }

    async fn kill(&self, worker: &WorkerHandle) -> Result<()> {
        let output = self.docker(&["kill", worker.name.as_str()]).await?;
        if output.success() || is_missing(&output) {
            Ok(())
        } else {
            Err(backend_error("docker kill", &output))
        }
    }

    async fn remove(&self, worker: &WorkerHandle) -> Result<()> {
        // Dropping the attached client kills it.
        drop(self.take_attached(&worker.name));

        let output = self.docker(&["rm", "-f", worker.name.as_str()]).await?;
        if output.success() || is_missing(&output) {
            tracing::debug!(worker = %worker.name, "worker removed");
            Ok(())
        } else {
            Err(backend_error("docker rm", &output))
        }
    }

    async fn logs(&self, worker: &WorkerHandle) -> Result<WorkerLogs> {
        let output = tokio::time::timeout(
            Duration::from_secs(30),
            self.docker(&["logs", worker.name.as_str()]),
        )
        .await
        .map_err(|_| Error::Backend(format!("docker logs {} timed out", worker.name)))??;
        if !output.success() && !is_missing(&output) {
            return Err(backend_error("docker logs", &output));
        }
        Ok(WorkerLogs {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn list(&self, identity: &SandboxKey) -> Result<Vec<WorkerHandle>> {
        let filter = format!("label={}={}", IDENTITY_LABEL, identity);
        let output = self
            .docker(&["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"])
            .await?;
        if !output.success() {
            return Err(backend_error("docker ps", &output));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| WorkerHandle {
                name: name.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::{MountTable, PathMapping};
    use crate::sanitizer::Sanitizer;

    fn spec() -> LaunchSpec {
        let mut mounts = MountTable::new();
        mounts
            .push(
                "/workspace/ws/key/demo".into(),
                "/src/demo".into(),
                MountMode::ReadWrite,
            )
            .unwrap();
        mounts
            .push(
                "/workspace/ws/key/build/work/poc".into(),
                "/testcase".into(),
                MountMode::ReadOnly,
            )
            .unwrap();
        LaunchSpec {
            name: "patch-sandbox-test".to_string(),
            identity: SandboxKey::baseline(Sanitizer::Address),
            image: "gcr.io/oss-fuzz/demo".to_string(),
            mounts,
            env: vec![("SANITIZER".to_string(), "address".to_string())],
            command: vec!["compile".to_string()],
            privileged: true,
        }
    }

    #[test]
    fn create_args_render_mounts_env_and_labels() {
        let backend = DockerBackend::new(HostPaths::Direct);
        let args = backend.create_args(&spec()).unwrap();

        assert_eq!(&args[..3], &["create", "--name", "patch-sandbox-test"]);
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"SANITIZER=address".to_string()));
        assert!(args.contains(&"/workspace/ws/key/demo:/src/demo".to_string()));
        assert!(args.contains(&"/workspace/ws/key/build/work/poc:/testcase:ro".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("patch-sandbox.identity=")));
        assert_eq!(&args[args.len() - 2..], &["gcr.io/oss-fuzz/demo", "compile"]);
    }

    #[test]
    fn nested_host_paths_translate_volumes() {
        let backend = DockerBackend::new(HostPaths::from_mappings(vec![PathMapping {
            control: "/workspace".into(),
            host: "/home/ci/workspace".into(),
        }]));
        let args = backend.create_args(&spec()).unwrap();
        assert!(args.contains(&"/home/ci/workspace/ws/key/demo:/src/demo".to_string()));
    }

    #[test]
    fn unmapped_mount_is_refused_in_nested_mode() {
        let backend = DockerBackend::new(HostPaths::from_mappings(vec![PathMapping {
            control: "/elsewhere".into(),
            host: "/host".into(),
        }]));
        assert!(matches!(
            backend.create_args(&spec()),
            Err(Error::PathNotMapped(_))
        ));
    }

    /// Writes an executable stand-in for the docker CLI.
    fn write_cli(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// A docker CLI whose `start` runs `script` and exits 0.
    fn fake_cli(dir: &std::path::Path, script: &str) -> String {
        write_cli(
            dir,
            &format!(
                "case \"$1\" in\n  start)\n{}\n    exit 0;;\n  *) exit 0;;\nesac\n",
                script
            ),
        )
    }

    #[test]
    fn decode_line_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"plain\r\n"), "plain");
        assert_eq!(decode_line(b"bad \xff\xfe bytes\n"), "bad \u{fffd}\u{fffd} bytes");
        assert_eq!(decode_line(b"no newline"), "no newline");
    }

    #[tokio::test]
    async fn wait_survives_non_utf8_output() {
        let temp = tempfile::TempDir::new().unwrap();
        let cli = fake_cli(
            temp.path(),
            r#"    printf 'garbage \377\376 bytes\n'
    printf 'stderr \377 noise\n' >&2
    i=0
    while [ $i -lt 4096 ]; do echo "line $i"; i=$((i+1)); done
    echo done >&2"#,
        );
        let backend = DockerBackend::new(HostPaths::Direct).with_cli(cli);

        let handle = backend.launch(&spec()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), backend.wait(&handle))
            .await
            .expect("wait must return once the worker exits")
            .unwrap();

        assert_eq!(exit.code, Some(0));
        assert!(exit.logs.stdout.starts_with("garbage \u{fffd}\u{fffd} bytes\n"));
        assert!(exit.logs.stdout.contains("line 4095\n"));
        assert!(exit.logs.stderr.contains("stderr \u{fffd} noise"));
        assert!(exit.logs.stderr.ends_with("done\n"));

        backend.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn failed_pull_is_retried_per_policy() {
        let temp = tempfile::TempDir::new().unwrap();
        let pulls = temp.path().join("pulls");
        let cli = write_cli(
            temp.path(),
            &format!(
                "if [ \"$1\" = pull ]; then\n  echo pull >> {}\n  echo 'manifest unknown' >&2\n  exit 1\nfi\nexit 0\n",
                pulls.display()
            ),
        );
        let backend = DockerBackend::new(HostPaths::Direct)
            .with_cli(cli)
            .with_retry(RetryPolicy::new(
                4,
                Duration::from_millis(1),
                Duration::from_millis(1),
            ));

        let result = backend
            .prepare_image("demo-builder", Some("registry.local/demo-builder"))
            .await;

        assert!(matches!(result, Err(Error::Backend(_))));
        let attempts = std::fs::read_to_string(&pulls).unwrap();
        assert_eq!(attempts.lines().count(), 4);
    }
}
