use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::task::Dependency;

/// Default location of the local cache, relative to the workspace root.
pub const DEFAULT_CACHE_DIR: &str = ".turbo/cache";

/// Root configuration (`monox.toml`).
///
/// The `[pipeline.*]` tables use the same field names as the dry-run JSON
/// contract (`dependsOn`, `outputMode`, ...); the other sections are plain
/// snake_case TOML.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub pipeline: BTreeMap<String, TaskDefinition>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkspaceConfig {
    /// Glob patterns for package directories
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Inputs to the run-global fingerprint.
#[derive(Debug, Deserialize, Clone)]
pub struct GlobalConfig {
    /// Environment variable names that affect every task hash
    #[serde(default)]
    pub env: Vec<String>,
    /// User-chosen salt for the global hash
    #[serde(default)]
    pub cache_key: String,
    /// Workspace-root files that affect every task hash
    #[serde(default)]
    pub root_files: Vec<String>,
    /// External-dependencies lockfile at the workspace root
    #[serde(default = "default_lockfile")]
    pub lockfile: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            cache_key: String::new(),
            root_files: Vec::new(),
            lockfile: default_lockfile(),
        }
    }
}

fn default_lockfile() -> String {
    "package-lock.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Cache directory, relative to the workspace root
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }
}

fn default_cache_enabled() -> bool {
    true
}

/// A task definition as authored in the pipeline, and unchanged once
/// resolved onto a node: a package-scoped key replaces the global one
/// wholesale, so no merged form exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskDefinition {
    /// Glob patterns (package-relative) captured into the cache; `!`-prefixed
    /// entries are exclusions
    pub outputs: Vec<String>,
    pub cache: bool,
    /// Task references: `task`, `^task`, or `pkg#task`
    pub depends_on: Vec<String>,
    /// Glob patterns restricting which package files feed the hash; empty
    /// means every file in the package
    pub inputs: Vec<String>,
    pub output_mode: OutputMode,
    /// Environment variable names contributing to the hash
    pub env: Vec<String>,
    /// Long-running task; nothing may depend on it
    pub persistent: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            cache: true,
            depends_on: Vec::new(),
            inputs: Vec::new(),
            output_mode: OutputMode::default(),
            env: Vec::new(),
            persistent: false,
        }
    }
}

impl TaskDefinition {
    /// The definition attached to a node the pipeline does not mention.
    pub fn no_op() -> Self {
        Self {
            cache: false,
            ..Self::default()
        }
    }
}

/// How a task's output reaches the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Stream live output; replay the full cached log on a hit
    #[default]
    Full,
    /// Print the hash line only
    #[serde(alias = "hash")]
    HashOnly,
    /// Stream on a miss; hash line only on a hit
    NewOnly,
    /// Buffer output and emit it only if the task fails
    ErrorsOnly,
    /// Suppress all task output
    None,
}

impl std::str::FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(OutputMode::Full),
            "hash-only" | "hash" => Ok(OutputMode::HashOnly),
            "new-only" => Ok(OutputMode::NewOnly),
            "errors-only" => Ok(OutputMode::ErrorsOnly),
            "none" => Ok(OutputMode::None),
            other => Err(format!("invalid output mode '{other}'")),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        // Expand environment variables in the content
        let expanded = shellexpand::env(&content)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| content.clone());

        let config: Config =
            toml::from_str(&expanded).with_context(|| "Failed to parse monox.toml")?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (key, definition) in &self.pipeline {
            for reference in &definition.depends_on {
                Dependency::parse(reference).map_err(|reason| ConfigError::InvalidDependency {
                    key: key.clone(),
                    reference: reference.clone(),
                    reason,
                })?;
            }
        }
        Ok(())
    }

    /// Look up the pipeline definition for `(package, task)`: the
    /// package-scoped key wins verbatim, then the global key.
    pub fn task_definition(&self, package: &str, task: &str) -> Option<&TaskDefinition> {
        self.pipeline
            .get(&format!("{package}#{task}"))
            .or_else(|| self.pipeline.get(task))
    }

    /// The definition attached to a node: a pipeline entry cloned, or the
    /// no-op definition when the pipeline has nothing for this node.
    pub fn resolved_task_definition(&self, package: &str, task: &str) -> TaskDefinition {
        self.task_definition(package, task)
            .cloned()
            .unwrap_or_else(TaskDefinition::no_op)
    }

    /// Whether any pipeline key (global or package-scoped) defines `task`.
    pub fn is_task_defined(&self, task: &str) -> bool {
        if self.pipeline.contains_key(task) {
            return true;
        }
        let scoped = format!("#{task}");
        self.pipeline.keys().any(|k| k.ends_with(&scoped))
    }

    pub fn task_keys(&self) -> Vec<&String> {
        self.pipeline.keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[workspace]
packages = ["packages/*"]

[global]
env = ["SOME_ENV_VAR", "VERCEL_ANALYTICS_ID"]
cache_key = "v1"
root_files = ["monox.toml"]

[pipeline.build]
outputs = ["dist/**", "!dist/**/*.map"]
dependsOn = ["^build"]

[pipeline.test]
dependsOn = ["build"]
inputs = ["src/**/*.ts", "test/**/*.ts"]
outputMode = "new-only"
env = ["NODE_ENV"]

[pipeline.dev]
cache = false
persistent = true
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.workspace.packages, vec!["packages/*"]);
        assert_eq!(config.global.env.len(), 2);
        assert_eq!(config.global.lockfile, "package-lock.json");

        let build = config.pipeline.get("build").unwrap();
        assert_eq!(build.depends_on, vec!["^build"]);
        assert!(build.cache);
        assert_eq!(build.outputs.len(), 2);

        let test = config.pipeline.get("test").unwrap();
        assert_eq!(test.output_mode, OutputMode::NewOnly);
        assert_eq!(test.env, vec!["NODE_ENV"]);

        let dev = config.pipeline.get("dev").unwrap();
        assert!(dev.persistent);
        assert!(!dev.cache);
    }

    #[test]
    fn test_scoped_definition_replaces_wholesale() {
        let toml_content = r#"
[pipeline.build]
outputs = ["dist/**"]
env = ["GLOBAL_VAR"]

[pipeline."web#build"]
env = ["WEB_VAR"]
"#;
        let config: Config = toml::from_str(toml_content).unwrap();

        // The scoped definition is used verbatim: no fields leak in from the
        // global one.
        let resolved = config.resolved_task_definition("web", "build");
        assert_eq!(resolved.env, vec!["WEB_VAR"]);
        assert!(resolved.outputs.is_empty());

        let other = config.resolved_task_definition("api", "build");
        assert_eq!(other.env, vec!["GLOBAL_VAR"]);
        assert_eq!(other.outputs, vec!["dist/**"]);
    }

    #[test]
    fn test_undefined_task_is_no_op() {
        let config = Config::default();
        let resolved = config.resolved_task_definition("web", "lint");
        assert!(!resolved.cache);
        assert!(resolved.outputs.is_empty());
        assert!(!config.is_task_defined("lint"));
    }

    #[test]
    fn test_is_task_defined_by_scoped_key() {
        let toml_content = r#"
[pipeline."web#deploy"]
cache = false
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.is_task_defined("deploy"));
        assert!(!config.is_task_defined("build"));
    }

    #[test]
    fn test_output_mode_aliases() {
        let full: OutputMode = "full".parse().unwrap();
        assert_eq!(full, OutputMode::Full);
        let hash: OutputMode = "hash".parse().unwrap();
        assert_eq!(hash, OutputMode::HashOnly);
        let hash_only: OutputMode = "hash-only".parse().unwrap();
        assert_eq!(hash_only, OutputMode::HashOnly);
        assert!("loud".parse::<OutputMode>().is_err());
    }

    #[test]
    fn test_invalid_depends_on_rejected() {
        let toml_content = r#"
[pipeline.build]
dependsOn = ["^"]
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_err());
    }
}
