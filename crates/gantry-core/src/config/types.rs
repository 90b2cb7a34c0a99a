//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Main configuration for gantry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Files (globs, relative to the repository root) that affect every task
    pub global_dependencies: Vec<String>,

    /// Environment variables whose values affect every task hash
    pub global_env: Vec<String>,

    /// Wildcard patterns for variables passed through to every task.
    /// `None` and an empty list are distinct: an explicit empty list opts
    /// every task into strict env handling under `infer`.
    pub global_pass_through_env: Option<Vec<String>>,

    /// `.env` files read at the root, in load order
    pub global_dot_env: Option<Vec<String>>,

    /// How task environments are resolved
    pub env_mode: EnvMode,

    /// Maximum concurrent tasks
    pub concurrency: usize,

    /// Task pipeline definitions keyed by `task` or `package#task`
    pub pipeline: BTreeMap<String, PipelineTask>,

    /// Cache configuration
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: None,
            global_dependencies: Vec::new(),
            global_env: Vec::new(),
            global_pass_through_env: None,
            global_dot_env: None,
            env_mode: EnvMode::default(),
            concurrency: 10,
            pipeline: BTreeMap::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Look up the pipeline entry for a task in a package.
    ///
    /// A `package#task` entry wins over the generic `task` entry.
    pub fn task_config(&self, package: &str, task: &str) -> Option<&PipelineTask> {
        self.pipeline
            .get(&format!("{}#{}", package, task))
            .or_else(|| self.pipeline.get(task))
    }

    /// Whether any pipeline entry (generic or package-specific) names this task
    pub fn has_task(&self, task: &str) -> bool {
        self.pipeline.keys().any(|key| match key.split_once('#') {
            Some((_, name)) => name == task,
            None => key == task,
        })
    }
}

/// Environment variable handling mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    /// Strict when pass-through patterns are declared, loose otherwise
    #[default]
    Infer,
    /// The whole environment is visible to tasks
    Loose,
    /// Only declared variables are visible to tasks
    Strict,
}

impl fmt::Display for EnvMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infer => write!(f, "infer"),
            Self::Loose => write!(f, "loose"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// How task output is replayed to the terminal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Show all output, including replayed logs on a cache hit
    #[default]
    Full,
    /// Only show output of tasks that actually ran
    New,
    /// Show nothing
    None,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::New => write!(f, "new"),
            Self::None => write!(f, "none"),
        }
    }
}

/// A task in the pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineTask {
    /// Output globs, relative to the package; `!` prefixes an exclusion
    pub outputs: Vec<String>,

    /// Whether results of this task are cached
    pub cache: bool,

    /// Dependency rules: `^task`, `task` or `package#task`
    pub depends_on: Vec<String>,

    /// Input globs restricting which package files are hashed
    pub inputs: Vec<String>,

    /// Terminal output mode
    pub output_mode: OutputMode,

    /// Whether this is a long-running task that never exits
    pub persistent: bool,

    /// Environment variables (names or wildcards) whose values are hashed
    pub env: Vec<String>,

    /// Wildcard patterns for variables passed through without hashing values
    pub pass_through_env: Option<Vec<String>>,

    /// `.env` files in the package directory, in load order
    pub dot_env: Option<Vec<String>>,
}

impl Default for PipelineTask {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            cache: true,
            depends_on: Vec::new(),
            inputs: Vec::new(),
            output_mode: OutputMode::default(),
            persistent: false,
            env: Vec::new(),
            pass_through_env: None,
            dot_env: None,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Whether the local cache is enabled
    pub enabled: bool,

    /// Cache directory, relative to the repository root
    pub dir: PathBuf,

    /// Remote cache tier
    pub remote: RemoteCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".gantry/cache"),
            remote: RemoteCacheConfig::default(),
        }
    }
}

/// Remote cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteCacheConfig {
    /// Whether the remote tier is used
    pub enabled: bool,

    /// Base URL of the artifact API
    pub url: Option<String>,

    /// Bearer token
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Team identifier sent with every request
    pub team: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            token: None,
            team: None,
            timeout_secs: 30,
        }
    }
}
