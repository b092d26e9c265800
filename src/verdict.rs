//! Outcomes of worker executions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{WorkerExit, WorkerLogs, DAEMON_ERROR, DOCKER_FAILURE_EXIT};
use crate::config::Language;
use crate::crash::{parse_crash, CrashReport};
use crate::driver::RunRequest;
use crate::error::{Error, Result};
use crate::identity::SandboxKey;

/// Lines kept by [`Verdict::log_excerpt`].
const EXCERPT_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictStatus {
    /// Build succeeded, or the reproduction did not crash.
    Succeeded,
    BuildFailed,
    Crashed,
    TimedOut,
}

/// The outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub identity: SandboxKey,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash: Option<CrashReport>,
    /// The result of an earlier build was reused; no worker ran.
    #[serde(default)]
    pub reused: bool,
}

impl Verdict {
    fn from_logs(
        status: VerdictStatus,
        identity: &SandboxKey,
        exit_code: Option<i32>,
        logs: WorkerLogs,
        duration: Duration,
    ) -> Self {
        Self {
            status,
            identity: identity.clone(),
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            duration,
            crash: None,
            reused: false,
        }
    }

    /// A build that already succeeded in this sandbox.
    pub fn cached(identity: &SandboxKey) -> Self {
        Self {
            reused: true,
            ..Self::from_logs(
                VerdictStatus::Succeeded,
                identity,
                Some(0),
                WorkerLogs::default(),
                Duration::ZERO,
            )
        }
    }

    pub fn timed_out(identity: &SandboxKey, logs: WorkerLogs, duration: Duration) -> Self {
        Self::from_logs(VerdictStatus::TimedOut, identity, None, logs, duration)
    }

    /// Returns true for a clean build or a run without a crash.
    pub fn is_success(&self) -> bool {
        self.status == VerdictStatus::Succeeded
    }

    /// Returns true when a sanitizer report was found.
    pub fn is_crash(&self) -> bool {
        self.status == VerdictStatus::Crashed
    }

    /// The tail of the captured output, stderr first.
    pub fn log_excerpt(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(EXCERPT_LINES);
        lines[start..].join("\n")
    }
}

/// Turns a finished worker into a verdict.
///
/// Docker's own failures are infrastructure errors, never verdicts. A
/// reproduction that fails without a recognizable report still counts as a
/// crash.
pub fn classify(
    identity: &SandboxKey,
    request: &RunRequest,
    exit: WorkerExit,
    duration: Duration,
    language: Language,
) -> Result<Verdict> {
    if exit.code == Some(DOCKER_FAILURE_EXIT)
        || exit.logs.stderr.contains(DAEMON_ERROR)
        || exit.logs.stdout.contains(DAEMON_ERROR)
    {
        let verdict = Verdict::from_logs(
            VerdictStatus::BuildFailed,
            identity,
            exit.code,
            exit.logs,
            duration,
        );
        return Err(Error::BackendUnavailable(verdict.log_excerpt()).in_sandbox(identity));
    }

    let code = exit.code;
    if code == Some(0) {
        return Ok(Verdict::from_logs(
            VerdictStatus::Succeeded,
            identity,
            code,
            exit.logs,
            duration,
        ));
    }

    match request {
        RunRequest::Build { .. } | RunRequest::CheckBuild { .. } => Ok(Verdict::from_logs(
            VerdictStatus::BuildFailed,
            identity,
            code,
            exit.logs,
            duration,
        )),
        RunRequest::Reproduce { sanitizer, .. } => {
            let crash = parse_crash(&exit.logs.stdout, &exit.logs.stderr, *sanitizer, language)
                .unwrap_or_else(|| {
                    CrashReport::unknown(&format!("{}\n{}", exit.logs.stdout, exit.logs.stderr))
                });
            tracing::info!(
                identity = %identity,
                kind = ?crash.kind,
                signature = %crash.signature(),
                "crash detected"
            );
            Ok(Verdict {
                crash: Some(crash),
                ..Verdict::from_logs(VerdictStatus::Crashed, identity, code, exit.logs, duration)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::ReportKind;
    use crate::sanitizer::Sanitizer;

    fn exit(code: Option<i32>, stdout: &str, stderr: &str) -> WorkerExit {
        WorkerExit {
            code,
            logs: WorkerLogs {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        }
    }

    fn key() -> SandboxKey {
        SandboxKey::baseline(Sanitizer::Address)
    }

    #[test]
    fn build_statuses() {
        let request = RunRequest::build(Sanitizer::Address);

        let ok = classify(&key(), &request, exit(Some(0), "done", ""), Duration::ZERO, Language::CLike)
            .unwrap();
        assert_eq!(ok.status, VerdictStatus::Succeeded);

        let failed = classify(
            &key(),
            &request,
            exit(Some(1), "", "error: expected ';'"),
            Duration::ZERO,
            Language::CLike,
        )
        .unwrap();
        assert_eq!(failed.status, VerdictStatus::BuildFailed);
        assert_eq!(failed.log_excerpt(), "error: expected ';'");
    }

    #[test]
    fn reproduce_failure_is_a_crash_even_without_report() {
        let request = RunRequest::Reproduce {
            sanitizer: Sanitizer::Address,
            harness: "fuzz".to_string(),
        };
        let verdict = classify(
            &key(),
            &request,
            exit(Some(1), "", "Segmentation fault"),
            Duration::ZERO,
            Language::CLike,
        )
        .unwrap();

        assert!(verdict.is_crash());
        assert_eq!(verdict.crash.unwrap().kind, ReportKind::Unknown);
    }

    #[test]
    fn daemon_errors_are_infrastructure_failures() {
        let request = RunRequest::build(Sanitizer::Address);
        let err = classify(
            &key(),
            &request,
            exit(Some(125), "", "docker: Error response from daemon: no such image."),
            Duration::ZERO,
            Language::CLike,
        )
        .unwrap_err();

        assert_eq!(err.identity(), Some(&key()));
        assert!(!err.is_patch_error());
    }

    #[test]
    fn log_excerpt_keeps_the_tail() {
        let stderr: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        let verdict = Verdict::timed_out(
            &key(),
            WorkerLogs {
                stdout: String::new(),
                stderr,
            },
            Duration::from_secs(1),
        );
        let excerpt = verdict.log_excerpt();
        assert_eq!(excerpt.lines().count(), EXCERPT_LINES);
        assert!(excerpt.ends_with("line 99"));
    }

    #[test]
    fn verdict_serializes_with_kebab_case_status() {
        let json = serde_json::to_value(Verdict::cached(&key())).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["reused"], true);

        let json = serde_json::to_value(VerdictStatus::BuildFailed).unwrap();
        assert_eq!(json, "build-failed");
    }
}
