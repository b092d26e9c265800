//! Patch Sandbox - isolated, concurrent OSS-Fuzz style builds of candidate patches
//!
//! This library derives a content-addressed sandbox for every (patch, sanitizer)
//! pair, materializes the patched source without touching the pristine tree,
//! runs ephemeral build and reproduce workers with explicit mount tables, and
//! reports verdicts back in the caller's path namespace.

pub mod backend;
pub mod builder;
pub mod config;
pub mod crash;
pub mod debug;
pub mod driver;
pub mod error;
pub mod identity;
pub mod inject;
pub mod patch;
pub mod paths;
pub mod retry;
pub mod sandbox;
pub mod sanitizer;
mod tool;
pub mod verdict;
pub mod workspace;

pub use backend::{
    DockerBackend, ExecutionBackend, LaunchSpec, ScriptedBackend, ScriptedOutcome, WorkerExit,
    WorkerHandle, WorkerLogs,
};
pub use builder::{BuildArtifacts, BuildOptions, BuildOutcome, PatchBuilder, Poc};
pub use config::{Language, SandboxConfig, Validate, ValidationResult};
pub use crash::{CrashReport, ReportKind, ReproCommand};
pub use driver::{DriverProfile, ExecutionDriver, RunRequest};
pub use error::{Error, ErrorKind, Result};
pub use identity::{identity, SandboxKey};
pub use inject::ToolingStatus;
pub use patch::{Hunk, Patch};
pub use paths::{
    to_control_path, to_worker_path, HostPaths, MountMode, MountTable, PathMapping, WorkerMount,
};
pub use retry::RetryPolicy;
pub use sandbox::{materialize, Materialization, SandboxLayout};
pub use sanitizer::Sanitizer;
pub use verdict::{Verdict, VerdictStatus};
pub use workspace::{Retention, SandboxLease, Task, TaskConfig};
