//! Patch Sandbox CLI
//!
//! Builds a patch, replays a proof of concept against it, or checks that it
//! applies, and prints the outcome as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use patch_sandbox::{
    DockerBackend, Error, Patch, PatchBuilder, Poc, Retention, SandboxConfig, Task, Validate,
    Verdict, VerdictStatus,
};

const EXIT_OK: i32 = 0;
const EXIT_CRASH: i32 = 1;
const EXIT_BUILD_FAILED: i32 = 2;
const EXIT_TIMED_OUT: i32 = 3;
const EXIT_PATCH_REJECTED: i32 = 4;
const EXIT_INFRASTRUCTURE: i32 = 5;

enum Command {
    Build { patch: Option<PathBuf> },
    Reproduce {
        harness: String,
        poc: PathBuf,
        patch: Option<PathBuf>,
    },
    Check { patch: PathBuf },
}

fn usage(program: &str) -> ! {
    eprintln!("Usage:");
    eprintln!("  {} <config.toml> build [patch-file]", program);
    eprintln!("  {} <config.toml> reproduce <harness> <poc> [patch-file]", program);
    eprintln!("  {} <config.toml> check <patch-file>", program);
    eprintln!("\nWithout a patch file the unmodified source is used.");
    eprintln!("\nExit codes: 0 ok / no crash, 1 crash, 2 build failed, 3 timed out,");
    eprintln!("            4 patch does not apply, 5 infrastructure failure");
    eprintln!("\nEnvironment variables:");
    eprintln!("  PATCH_SANDBOX_DEBUG=1           Verbose logging");
    eprintln!("  PATCH_SANDBOX_KEEP_WORKSPACE=1  Keep the workspace for inspection");
    std::process::exit(EXIT_INFRASTRUCTURE);
}

fn parse_command(args: &[String]) -> Option<Command> {
    match args {
        [cmd] if cmd == "build" => Some(Command::Build { patch: None }),
        [cmd, patch] if cmd == "build" => Some(Command::Build {
            patch: Some(patch.into()),
        }),
        [cmd, harness, poc] if cmd == "reproduce" => Some(Command::Reproduce {
            harness: harness.clone(),
            poc: poc.into(),
            patch: None,
        }),
        [cmd, harness, poc, patch] if cmd == "reproduce" => Some(Command::Reproduce {
            harness: harness.clone(),
            poc: poc.into(),
            patch: Some(patch.into()),
        }),
        [cmd, patch] if cmd == "check" => Some(Command::Check {
            patch: patch.into(),
        }),
        _ => None,
    }
}

fn read_patch(path: Option<&Path>) -> patch_sandbox::Result<Patch> {
    match path {
        Some(path) => Ok(Patch::new(std::fs::read_to_string(path)?)),
        None => Ok(Patch::baseline()),
    }
}

fn verdict_exit_code(verdict: &Verdict) -> i32 {
    match verdict.status {
        VerdictStatus::Succeeded => EXIT_OK,
        VerdictStatus::Crashed => EXIT_CRASH,
        VerdictStatus::BuildFailed => EXIT_BUILD_FAILED,
        VerdictStatus::TimedOut => EXIT_TIMED_OUT,
    }
}

fn error_exit_code(error: &Error) -> i32 {
    if error.is_patch_error() {
        EXIT_PATCH_REJECTED
    } else {
        EXIT_INFRASTRUCTURE
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!(error = %e, "failed to serialize report"),
    }
}

async fn execute(task: Arc<Task>, config: &SandboxConfig, command: Command) -> patch_sandbox::Result<i32> {
    if let Command::Check { patch } = &command {
        let patch = read_patch(Some(patch))?;
        task.check_patch(&patch).await?;
        tracing::info!("patch applies cleanly");
        return Ok(EXIT_OK);
    }

    let backend =
        Arc::new(DockerBackend::new(config.host_paths()).with_retry(config.retry_policy()));
    if !backend.is_available().await {
        return Err(Error::BackendUnavailable(
            "docker daemon is not reachable".to_string(),
        ));
    }
    let builder = PatchBuilder::from_config(task.clone(), backend, config)?;

    match command {
        Command::Build { patch } => {
            let patch = read_patch(patch.as_deref())?;
            task.check_patch(&patch).await?;
            let outcomes = builder.build_all(&patch).await?;
            print_json(&outcomes);
            Ok(outcomes
                .last()
                .map(|o| verdict_exit_code(&o.verdict))
                .unwrap_or(EXIT_OK))
        }
        Command::Reproduce {
            harness,
            poc,
            patch,
        } => {
            let patch = read_patch(patch.as_deref())?;
            task.check_patch(&patch).await?;
            let verdict = builder.replay(&Poc::new(poc, harness), &patch).await?;
            if let Some(crash) = &verdict.crash {
                tracing::info!(signature = %crash.signature(), "crash reproduced");
            }
            print_json(&verdict);
            Ok(verdict_exit_code(&verdict))
        }
        Command::Check { .. } => Ok(EXIT_OK),
    }
}

#[tokio::main]
async fn main() {
    let level = if patch_sandbox::debug::is_debug() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("patch-sandbox");
    if args.len() < 3 {
        usage(program);
    }
    let Some(command) = parse_command(&args[2..]) else {
        usage(program);
    };

    let config = match SandboxConfig::from_toml_file(Path::new(&args[1])) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(EXIT_INFRASTRUCTURE);
        }
    };
    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(warning = %warning, "configuration warning");
            }
        }
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(EXIT_INFRASTRUCTURE);
        }
    }

    let task_config = config.task_config();
    let retention = task_config.retention;
    let task = match Task::open(task_config).await {
        Ok(task) => Arc::new(task),
        Err(e) => {
            eprintln!("Failed to open task: {}", e);
            std::process::exit(EXIT_INFRASTRUCTURE);
        }
    };

    let code = match execute(task.clone(), &config, command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            error_exit_code(&e)
        }
    };

    if retention == Retention::Keep {
        eprintln!("Workspace kept at {}", task.root().display());
    }
    if let Err(e) = task.close(retention).await {
        tracing::error!(error = %e, "failed to close task");
    }
    std::process::exit(code);
}
