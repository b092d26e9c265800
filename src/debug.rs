//! Debug switches read from the environment.
//!
//! Environment variables:
//! - `PATCH_SANDBOX_DEBUG=1` - Verbose logging, including every worker output line
//! - `PATCH_SANDBOX_KEEP_WORKSPACE=1` - Never delete task workspaces
//!
//! When PATCH_SANDBOX_KEEP_WORKSPACE is enabled the workspace root is logged
//! at close so sandboxes can be inspected by hand.

use std::sync::OnceLock;

/// Global debug configuration loaded once at startup.
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

/// Debug configuration.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Enable verbose debug logging.
    pub debug_mode: bool,
    /// Retain workspaces regardless of configuration.
    pub keep_workspace: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl DebugConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            debug_mode: flag("PATCH_SANDBOX_DEBUG"),
            keep_workspace: flag("PATCH_SANDBOX_KEEP_WORKSPACE"),
        }
    }
}

/// Gets the global debug configuration.
pub fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Returns true when verbose logging is switched on.
pub fn is_debug() -> bool {
    get_config().debug_mode
}

/// Returns true when workspaces must be kept for inspection.
pub fn keep_workspace() -> bool {
    get_config().keep_workspace
}

/// Logs a worker command line before launch when debugging.
pub fn debug_command(program: &str, args: &[String]) {
    if is_debug() {
        eprintln!("[PATCH_SANDBOX_DEBUG] Running command:");
        eprintln!("  cmd: {}", program);
        eprintln!("  args: {:?}", args);
    }
}
