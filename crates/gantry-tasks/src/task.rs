//! Task types and definitions

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use gantry_core::config::defaults::TASK_LOG_DIR;
use gantry_core::{EnvMode, OutputMode, PipelineTask, ROOT_PKG_NAME};

/// Label used for tasks whose package has no script for them
pub const MISSING_TASK_LABEL: &str = "<NONEXISTENT>";

/// Unique identifier for a task within the workspace, written `package#task`
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TaskId {
    /// Package name
    pub package: String,
    /// Task name (e.g., "build", "test", "lint")
    pub task: String,
}

impl TaskId {
    /// Create a new task ID
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    /// Parse a task ID from "package#task" format
    pub fn parse(s: &str) -> Option<Self> {
        let (package, task) = s.split_once('#')?;
        if package.is_empty() || task.is_empty() || task.contains('#') {
            return None;
        }
        Some(Self::new(package, task))
    }

    /// Whether this task belongs to the repository root pseudo-package
    pub fn is_root_package(&self) -> bool {
        self.package == ROOT_PKG_NAME
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.package, self.task)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid task id '{}'", value))
    }
}

/// Output globs split into inclusions and `!`-prefixed exclusions, each sorted
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    pub fn from_globs(globs: &[String]) -> Self {
        let mut outputs = Self::default();
        for glob in globs {
            match glob.strip_prefix('!') {
                Some(excluded) => outputs.exclusions.push(excluded.to_string()),
                None => outputs.inclusions.push(glob.clone()),
            }
        }
        outputs.sort();
        outputs
    }

    pub fn sort(&mut self) {
        self.inclusions.sort();
        self.inclusions.dedup();
        self.exclusions.sort();
        self.exclusions.dedup();
    }

    pub fn is_empty(&self) -> bool {
        self.inclusions.is_empty()
    }
}

/// Pipeline entry for a task, with dependency rules split by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,
    /// `^task` rules: the task in every workspace dependency
    pub topological_dependencies: Vec<String>,
    /// `task` and `pkg#task` rules
    pub task_dependencies: Vec<String>,
    pub inputs: Vec<String>,
    pub output_mode: OutputMode,
    pub persistent: bool,
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub dot_env: Option<Vec<String>>,
}

impl From<&PipelineTask> for TaskDefinition {
    fn from(task: &PipelineTask) -> Self {
        let mut topological_dependencies = Vec::new();
        let mut task_dependencies = Vec::new();
        for dep in &task.depends_on {
            match dep.strip_prefix('^') {
                Some(name) => topological_dependencies.push(name.to_string()),
                None => task_dependencies.push(dep.clone()),
            }
        }
        topological_dependencies.sort();
        task_dependencies.sort();

        let mut env = task.env.clone();
        env.sort();
        let pass_through_env = task.pass_through_env.clone().map(|mut p| {
            p.sort();
            p
        });
        let mut inputs = task.inputs.clone();
        inputs.sort();

        Self {
            outputs: TaskOutputs::from_globs(&task.outputs),
            cache: task.cache,
            topological_dependencies,
            task_dependencies,
            inputs,
            output_mode: task.output_mode,
            persistent: task.persistent,
            env,
            pass_through_env,
            dot_env: task.dot_env.clone(),
        }
    }
}

/// One task in one package, resolved for execution
#[derive(Debug, Clone)]
pub struct PackageTask {
    pub id: TaskId,
    /// Package directory relative to the repository root
    pub dir: PathBuf,
    /// Shell command, if the package defines a script for the task
    pub command: Option<String>,
    pub definition: TaskDefinition,
    /// Env mode after resolving `infer`
    pub env_mode: EnvMode,
    pub hash: String,
    /// Extra arguments appended to the command
    pub pass_through_args: Vec<String>,
}

impl PackageTask {
    /// Log file path relative to the repository root
    pub fn log_file(&self) -> PathBuf {
        self.dir.join(TASK_LOG_DIR).join(log_file_name(&self.id.task))
    }

    /// Log file path relative to the package, `/`-separated
    fn package_relative_log_file(&self) -> String {
        format!("{}/{}", TASK_LOG_DIR, log_file_name(&self.id.task))
    }

    /// Prefix used for this task's output lines
    pub fn output_prefix(&self, single_package: bool) -> String {
        if single_package {
            self.id.task.clone()
        } else {
            format!("{}:{}", self.id.package, self.id.task)
        }
    }

    /// Package-relative output globs to cache, including the log file
    pub fn hashable_outputs(&self) -> TaskOutputs {
        let mut inclusions = vec![self.package_relative_log_file()];
        inclusions.extend(self.definition.outputs.inclusions.iter().cloned());
        let mut outputs = TaskOutputs {
            inclusions,
            exclusions: self.definition.outputs.exclusions.clone(),
        };
        outputs.sort();
        outputs
    }

    /// Output globs relative to the repository root
    pub fn repo_relative_outputs(&self) -> TaskOutputs {
        let outputs = self.hashable_outputs();
        let anchor = |glob: &String| join_unix(&self.dir, glob);
        TaskOutputs {
            inclusions: outputs.inclusions.iter().map(anchor).collect(),
            exclusions: outputs.exclusions.iter().map(anchor).collect(),
        }
    }
}

fn log_file_name(task: &str) -> String {
    format!("gantry-{}.log", task.replace(':', "$colon$"))
}

/// Join a relative directory and a `/`-separated glob
fn join_unix(dir: &Path, glob: &str) -> String {
    let prefix: Vec<String> = dir
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if prefix.is_empty() {
        glob.to_string()
    } else {
        format!("{}/{}", prefix.join("/"), glob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package_task(package: &str, task: &str, dir: &str) -> PackageTask {
        PackageTask {
            id: TaskId::new(package, task),
            dir: PathBuf::from(dir),
            command: Some("echo hi".to_string()),
            definition: TaskDefinition::from(&PipelineTask {
                outputs: vec!["dist/**".to_string(), "!dist/cache/**".to_string()],
                ..PipelineTask::default()
            }),
            env_mode: EnvMode::Loose,
            hash: "abc".to_string(),
            pass_through_args: Vec::new(),
        }
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new("core", "build");
        assert_eq!(id.to_string(), "core#build");
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::parse("core#build").unwrap();
        assert_eq!(id.package, "core");
        assert_eq!(id.task, "build");

        let root = TaskId::parse("//#format").unwrap();
        assert!(root.is_root_package());
    }

    #[test]
    fn test_task_id_parse_invalid() {
        assert!(TaskId::parse("nobuild").is_none());
        assert!(TaskId::parse("#build").is_none());
        assert!(TaskId::parse("a#b#c").is_none());
    }

    #[test]
    fn test_task_id_serializes_as_string() {
        let json = serde_json::to_string(&TaskId::new("web", "test")).unwrap();
        assert_eq!(json, "\"web#test\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskId::new("web", "test"));
    }

    #[test]
    fn test_definition_splits_dependencies() {
        let def = TaskDefinition::from(&PipelineTask {
            depends_on: vec![
                "^build".to_string(),
                "codegen".to_string(),
                "core#lint".to_string(),
            ],
            env: vec!["B".to_string(), "A".to_string()],
            ..PipelineTask::default()
        });
        assert_eq!(def.topological_dependencies, vec!["build"]);
        assert_eq!(def.task_dependencies, vec!["codegen", "core#lint"]);
        assert_eq!(def.env, vec!["A", "B"]);
        assert!(def.cache);
    }

    #[test]
    fn test_outputs_split_and_sorted() {
        let outputs = TaskOutputs::from_globs(&[
            "out/**".to_string(),
            "!dist/tmp".to_string(),
            "dist/**".to_string(),
        ]);
        assert_eq!(outputs.inclusions, vec!["dist/**", "out/**"]);
        assert_eq!(outputs.exclusions, vec!["dist/tmp"]);
    }

    #[test]
    fn test_log_file_escapes_colons() {
        let task = package_task("web", "test:unit", "apps/web");
        assert_eq!(
            task.log_file(),
            PathBuf::from("apps/web/.gantry/gantry-test$colon$unit.log")
        );
    }

    #[test]
    fn test_output_prefix() {
        let task = package_task("web", "build", "apps/web");
        assert_eq!(task.output_prefix(false), "web:build");
        assert_eq!(task.output_prefix(true), "build");
    }

    #[test]
    fn test_hashable_outputs_include_log() {
        let task = package_task("web", "build", "apps/web");
        let outputs = task.hashable_outputs();
        assert_eq!(outputs.inclusions, vec![".gantry/gantry-build.log", "dist/**"]);
        assert_eq!(outputs.exclusions, vec!["dist/cache/**"]);

        let anchored = task.repo_relative_outputs();
        assert_eq!(
            anchored.inclusions,
            vec!["apps/web/.gantry/gantry-build.log", "apps/web/dist/**"]
        );
    }

    #[test]
    fn test_root_package_outputs_are_unprefixed() {
        let task = package_task("//", "format", "");
        assert_eq!(
            task.repo_relative_outputs().inclusions[0],
            ".gantry/gantry-format.log"
        );
    }
}
