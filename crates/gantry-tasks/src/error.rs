//! Task graph, hashing and execution errors

use std::path::PathBuf;

use thiserror::Error;

use gantry_cache::CacheError;

use crate::task::TaskId;

/// Structural errors raised while building the task graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A requested task is not named anywhere in the pipeline
    #[error("Could not find task '{0}' in the pipeline")]
    TaskNotFound(String),

    /// A task is reachable but has no pipeline entry for its package
    #[error("Could not find a pipeline definition for {task}{}", required_by_suffix(.required_by))]
    MissingTaskDefinition {
        task: TaskId,
        required_by: Option<TaskId>,
    },

    /// A `pkg#task` dependency names a package that is not in the workspace
    #[error("Package '{package}' referenced by {required_by} does not exist")]
    UnknownPackage { package: String, required_by: TaskId },

    /// Persistent tasks never finish, so nothing may wait on them
    #[error("{dependent} depends on persistent task {dependency}, which never exits")]
    PersistentDependency { dependency: TaskId, dependent: TaskId },

    /// The task graph contains a cycle
    #[error("Cyclic dependency detected: {0}")]
    Cycle(String),
}

fn required_by_suffix(required_by: &Option<TaskId>) -> String {
    match required_by {
        Some(id) => format!(" (required by {})", id),
        None => String::new(),
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

/// Environment pattern errors
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid environment variable pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors computing a cache key
#[derive(Debug, Error)]
pub enum HashError {
    #[error("Failed to hash {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk files: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Failed to walk package files: {0}")]
    Ignore(#[from] ignore::Error),

    #[error("Invalid glob: {0}")]
    Glob(#[from] globset::Error),

    #[error("Failed to serialize hash inputs: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Env(#[from] EnvError),

    /// Upstream tasks must be hashed before their dependents
    #[error("Missing hash for dependency {0}")]
    MissingDependencyHash(TaskId),
}

/// Per-task execution errors reported by visitors
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Cannot find package {package} for task {task}")]
    MissingPackage { package: String, task: TaskId },

    #[error("Could not find definition for task {0}")]
    MissingDefinition(TaskId),

    #[error("Root task {task} ({command}) looks like it invokes gantry and might cause a loop")]
    SelfInvocation { task: TaskId, command: String },

    #[error("Hashing error: {0}")]
    Hash(#[from] HashError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Failed to spawn {task}: {source}")]
    Spawn {
        task: TaskId,
        #[source]
        source: std::io::Error,
    },

    #[error("{task} exited with code {}", exit_code_label(.code))]
    Failed { task: TaskId, code: Option<i32> },

    #[error("{0} was cancelled")]
    Cancelled(TaskId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Stop dispatching further tasks after this failure
    #[error("{0}")]
    StopExecution(Box<TaskError>),
}

impl TaskError {
    /// Wrap this error so that the engine stops the whole walk
    pub fn stop_execution(self) -> Self {
        match self {
            Self::StopExecution(_) => self,
            other => Self::StopExecution(Box::new(other)),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::StopExecution(_))
    }

    /// The error without any stop marker
    pub fn into_inner(self) -> Self {
        match self {
            Self::StopExecution(inner) => *inner,
            other => other,
        }
    }
}
