//! Configuration loading and validation.
//!
//! A task is described by one TOML file. Relative paths in it are resolved
//! against the file's directory. Validation runs before any workspace is
//! created so that mistakes surface early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::DriverProfile;
use crate::error::{Error, Result};
use crate::paths::{HostPaths, PathMapping};
use crate::retry::RetryPolicy;
use crate::sanitizer::Sanitizer;
use crate::workspace::{Retention, TaskConfig};

/// Default registry-less builder image prefix.
pub const BUILDER_IMAGE_PREFIX: &str = "gcr.io/oss-fuzz";

/// Default runner image for check-build and reproduce runs.
pub const DEFAULT_RUNNER_IMAGE: &str = "gcr.io/oss-fuzz-base/base-runner";

/// Source language family of a project, as far as crash classification cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// C, C++ and anything else compiled to native code.
    #[default]
    #[serde(alias = "c", alias = "c++")]
    CLike,
    Jvm,
}

impl Language {
    /// Maps an OSS-Fuzz `project.yaml` language value.
    pub fn from_project_language(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "jvm" | "java" => Language::Jvm,
            _ => Language::CLike,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProjectYaml {
    #[serde(default)]
    language: Option<String>,
}

/// Reads the language from an OSS-Fuzz `project.yaml`.
pub fn read_project_language(path: &Path) -> Result<Language> {
    let content = std::fs::read_to_string(path)?;
    let project: ProjectYaml = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;
    Ok(project
        .language
        .as_deref()
        .map(Language::from_project_language)
        .unwrap_or_default())
}

/// Worker images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Build image. Defaults to `gcr.io/oss-fuzz/<project>`.
    #[serde(default)]
    pub builder: Option<String>,
    #[serde(default = "default_runner_image")]
    pub runner: String,
    /// Registry to pull `<registry>/<project>:latest` from before building.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default = "default_pull_attempts")]
    pub pull_attempts: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            builder: None,
            runner: default_runner_image(),
            registry: None,
            pull_attempts: default_pull_attempts(),
        }
    }
}

/// Where the task workspace lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Explicit root. Must be absent or empty.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Parent of a generated root.
    #[serde(default)]
    pub base: Option<PathBuf>,
    /// Keep the tree after the task ends.
    #[serde(default)]
    pub retain: bool,
}

/// Full task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub project: String,
    /// Pristine project source.
    pub source: PathBuf,
    #[serde(default = "default_sanitizers")]
    pub sanitizers: Vec<Sanitizer>,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_reproduce_timeout_secs")]
    pub reproduce_timeout_secs: u64,
    /// Run the runner image's build check after every successful build.
    #[serde(default = "default_check_build")]
    pub check_build: bool,
    /// Directory holding the compile interception assets (`bear.sh` etc.).
    #[serde(default)]
    pub compile_interception: Option<PathBuf>,
    /// Rebuild with `-O0 -g3` for debugging sessions.
    #[serde(default)]
    pub debug_flags: bool,
    /// Build script, relative to the project source.
    #[serde(default = "default_build_script")]
    pub build_script: PathBuf,
    /// Control → host prefixes when running inside a container.
    #[serde(default)]
    pub host_paths: Vec<PathMapping>,
    /// OSS-Fuzz `project.yaml` to read the language from.
    #[serde(default)]
    pub project_yaml: Option<PathBuf>,
    /// Overrides whatever `project.yaml` says.
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default = "default_fuzzing_engine")]
    pub fuzzing_engine: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
}

fn default_sanitizers() -> Vec<Sanitizer> {
    vec![Sanitizer::Address]
}

fn default_runner_image() -> String {
    DEFAULT_RUNNER_IMAGE.to_string()
}

fn default_pull_attempts() -> u32 {
    3
}

fn default_build_timeout_secs() -> u64 {
    3600
}

fn default_reproduce_timeout_secs() -> u64 {
    360
}

fn default_check_build() -> bool {
    true
}

fn default_build_script() -> PathBuf {
    PathBuf::from("build.sh")
}

fn default_fuzzing_engine() -> String {
    "libfuzzer".to_string()
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

impl SandboxConfig {
    /// Minimal configuration with every default applied.
    pub fn new(project: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            source: source.into(),
            sanitizers: default_sanitizers(),
            workspace: WorkspaceConfig::default(),
            images: ImageConfig::default(),
            build_timeout_secs: default_build_timeout_secs(),
            reproduce_timeout_secs: default_reproduce_timeout_secs(),
            check_build: default_check_build(),
            compile_interception: None,
            debug_flags: false,
            build_script: default_build_script(),
            host_paths: Vec::new(),
            project_yaml: None,
            language: None,
            fuzzing_engine: default_fuzzing_engine(),
            architecture: default_architecture(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration file and anchors its relative paths.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or(std::env::current_dir()?);
        config.anchor_paths(&base);
        Ok(config)
    }

    fn anchor_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        anchor(&mut self.source);
        if let Some(p) = self.workspace.root.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.workspace.base.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.compile_interception.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.project_yaml.as_mut() {
            anchor(p);
        }
    }

    /// Configured builder image, else the OSS-Fuzz image for the project.
    pub fn builder_image(&self) -> String {
        self.images
            .builder
            .clone()
            .unwrap_or_else(|| format!("{}/{}", BUILDER_IMAGE_PREFIX, self.project))
    }

    /// Returns the limit for one build worker.
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Returns the limit for one reproduction worker.
    pub fn reproduce_timeout(&self) -> Duration {
        Duration::from_secs(self.reproduce_timeout_secs)
    }

    /// Explicit language, else `project.yaml`, else C-like.
    pub fn language(&self) -> Result<Language> {
        if let Some(language) = self.language {
            return Ok(language);
        }
        match &self.project_yaml {
            Some(path) => read_project_language(path),
            None => Ok(Language::default()),
        }
    }

    /// Returns how control paths translate for the docker daemon.
    pub fn host_paths(&self) -> HostPaths {
        HostPaths::from_mappings(self.host_paths.clone())
    }

    /// Retries for image pulls, bounded by `images.pull_attempts`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.images.pull_attempts,
            Duration::from_secs(2),
            Duration::from_secs(30),
        )
    }

    /// Task settings; the keep-workspace switch forces retention.
    pub fn task_config(&self) -> TaskConfig {
        let retain = self.workspace.retain || crate::debug::keep_workspace();
        TaskConfig {
            project: self.project.clone(),
            source: self.source.clone(),
            sanitizers: self.sanitizers.clone(),
            workspace: self.workspace.root.clone(),
            workspace_base: self.workspace.base.clone(),
            retention: if retain {
                Retention::Keep
            } else {
                Retention::Remove
            },
        }
    }

    /// Worker settings for this project.
    pub fn driver_profile(&self) -> Result<DriverProfile> {
        Ok(DriverProfile {
            project: self.project.clone(),
            builder_image: self.builder_image(),
            runner_image: self.images.runner.clone(),
            fuzzing_engine: self.fuzzing_engine.clone(),
            architecture: self.architecture.clone(),
            language: self.language()?,
        })
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for ImageConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.runner.trim().is_empty() {
            result.add_error("images.runner cannot be empty");
        }
        if matches!(&self.builder, Some(b) if b.trim().is_empty()) {
            result.add_error("images.builder cannot be empty when set");
        }
        if self.pull_attempts == 0 {
            result.add_error("images.pull_attempts must be at least 1");
        }
        if matches!(&self.registry, Some(r) if r.contains("://")) {
            result.add_error("images.registry must be a registry host, not a URL");
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.project.trim().is_empty() {
            result.add_error("project cannot be empty");
        }
        if !self.source.is_dir() {
            result.add_error(format!("source {} is not a directory", self.source.display()));
        }

        if self.sanitizers.is_empty() {
            result.add_error("at least one sanitizer is required");
        }
        for (i, sanitizer) in self.sanitizers.iter().enumerate() {
            if self.sanitizers[..i].contains(sanitizer) {
                result.add_error(format!("sanitizer '{}' listed twice", sanitizer));
            }
        }

        if self.build_timeout_secs == 0 {
            result.add_error("build_timeout_secs must be greater than 0");
        }
        if self.reproduce_timeout_secs == 0 {
            result.add_error("reproduce_timeout_secs must be greater than 0");
        }
        if self.build_timeout_secs > 4 * 3600 {
            result.add_warning("build_timeout_secs over 4 hours may indicate a misconfiguration");
        }

        if self.workspace.root.is_some() && self.workspace.base.is_some() {
            result.add_warning("workspace.base is ignored when workspace.root is set");
        }

        for mapping in &self.host_paths {
            if !mapping.control.is_absolute() || !mapping.host.is_absolute() {
                result.add_error(format!(
                    "host path mapping {} -> {} must use absolute paths",
                    mapping.control.display(),
                    mapping.host.display()
                ));
            }
        }

        if let Some(assets) = &self.compile_interception {
            if !assets.join(crate::inject::SHIM_NAME).is_file() {
                result.add_warning(format!(
                    "compile interception assets at {} have no {}; no compile log will be produced",
                    assets.display(),
                    crate::inject::SHIM_NAME
                ));
            }
        }

        if self.build_script.is_absolute() {
            result.add_error("build_script must be relative to the project source");
        }

        if let Some(path) = &self.project_yaml {
            if self.language.is_none() {
                if let Err(e) = read_project_language(path) {
                    result.add_error(format!("cannot read project.yaml: {}", e));
                }
            }
        }

        result.merge(self.images.validate());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_toml_gets_defaults() {
        let config = SandboxConfig::from_toml_str(
            r#"
            project = "libpng"
            source = "/src/libpng"
            "#,
        )
        .unwrap();

        assert_eq!(config.sanitizers, vec![Sanitizer::Address]);
        assert_eq!(config.reproduce_timeout(), Duration::from_secs(360));
        assert!(config.check_build);
        assert_eq!(config.builder_image(), "gcr.io/oss-fuzz/libpng");
        assert_eq!(config.images.runner, DEFAULT_RUNNER_IMAGE);
        assert_eq!(config.fuzzing_engine, "libfuzzer");
        assert_eq!(config.language().unwrap(), Language::CLike);
    }

    #[test]
    fn full_toml_parses() {
        let config = SandboxConfig::from_toml_str(
            r#"
            project = "demo"
            source = "src"
            sanitizers = ["address", "undefined"]
            build_timeout_secs = 900
            check_build = false
            language = "jvm"

            [workspace]
            retain = true

            [images]
            builder = "registry.local/demo-builder"
            registry = "registry.local"

            [[host_paths]]
            control = "/workspace"
            host = "/home/ci/workspace"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.sanitizers,
            vec![Sanitizer::Address, Sanitizer::UndefinedBehavior]
        );
        assert_eq!(config.builder_image(), "registry.local/demo-builder");
        assert_eq!(config.language().unwrap(), Language::Jvm);
        assert!(config.workspace.retain);
        assert_eq!(config.host_paths.len(), 1);
        assert_eq!(config.task_config().retention, Retention::Keep);
    }

    #[test]
    fn pull_attempts_bound_the_retry_policy() {
        let default = SandboxConfig::from_toml_str("project = \"demo\"\nsource = \"/src\"\n").unwrap();
        assert_eq!(default.retry_policy().attempts(), 3);

        let config = SandboxConfig::from_toml_str(
            r#"
            project = "demo"
            source = "/src"

            [images]
            pull_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.retry_policy().attempts(), 5);
    }

    #[test]
    fn unknown_sanitizer_is_a_config_error() {
        let result = SandboxConfig::from_toml_str(
            r#"
            project = "demo"
            source = "/src"
            sanitizers = ["thread"]
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn relative_paths_are_anchored_to_the_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sandbox.toml");
        std::fs::write(&path, "project = \"demo\"\nsource = \"checkout\"\n").unwrap();

        let config = SandboxConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.source, temp.path().join("checkout"));
    }

    #[test]
    fn project_yaml_sets_language() {
        let temp = TempDir::new().unwrap();
        let yaml = temp.path().join("project.yaml");
        std::fs::write(&yaml, "homepage: https://example.org\nlanguage: jvm\n").unwrap();

        let mut config = SandboxConfig::new("demo", temp.path());
        config.project_yaml = Some(yaml);
        assert_eq!(config.language().unwrap(), Language::Jvm);

        config.language = Some(Language::CLike);
        assert_eq!(config.language().unwrap(), Language::CLike);
    }

    #[test]
    fn validation_catches_errors_and_warnings() {
        let temp = TempDir::new().unwrap();
        let mut config = SandboxConfig::new("demo", temp.path());
        assert!(config.validate().is_valid());

        config.sanitizers = vec![Sanitizer::Memory, Sanitizer::Memory];
        config.reproduce_timeout_secs = 0;
        config.host_paths = vec![PathMapping {
            control: "relative".into(),
            host: "/host".into(),
        }];
        let result = config.validate();
        assert_eq!(result.errors.len(), 3);

        let mut config = SandboxConfig::new("demo", temp.path());
        config.compile_interception = Some(temp.path().join("no-assets"));
        let result = config.validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn missing_source_is_invalid() {
        let config = SandboxConfig::new("demo", "/definitely/not/a/source/tree");
        assert!(config.validate().into_result().is_err());
    }

    #[test]
    fn validation_result_into_result_ok_on_valid() {
        let mut result = ValidationResult::default();
        result.add_warning("just a warning");
        assert_eq!(result.into_result().unwrap(), vec!["just a warning"]);
    }
}
