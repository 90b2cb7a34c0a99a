//! Per-task cache keys
//!
//! A task's key folds in the keys of its direct dependencies rather than
//! their inputs, so any change upstream ripples through every descendant.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, instrument};

use gantry_core::EnvMode;

use crate::env::{DetailedMap, EnvironmentVariableMap};
use crate::error::HashError;
use crate::task::{PackageTask, TaskDefinition, TaskId, TaskOutputs};

use super::file::{hash_dot_env, hash_package_files};
use super::hash_of;

/// Everything that goes into one task's key
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskHashable<'a> {
    global_hash: &'a str,
    task_dependency_hashes: Vec<String>,
    package_dir: String,
    hash_of_files: String,
    external_deps_hash: &'a str,
    task: &'a str,
    command: Option<&'a str>,
    outputs: &'a TaskOutputs,
    pass_through_args: &'a [String],
    env: &'a [String],
    resolved_env_vars: Vec<String>,
    pass_through_env: Option<&'a [String]>,
    env_mode: EnvMode,
    dot_env: Vec<(String, String)>,
}

/// Declared inputs, or everything except the task's own outputs
fn input_globs(definition: &TaskDefinition) -> Cow<'_, [String]> {
    if definition.inputs.is_empty() {
        Cow::Owned(
            definition
                .outputs
                .inclusions
                .iter()
                .map(|glob| format!("!{glob}"))
                .collect(),
        )
    } else {
        Cow::Borrowed(&definition.inputs)
    }
}

/// Task-local hash inputs supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct TaskHashInputs {
    /// Direct upstream tasks; empty in parallel mode
    pub dependencies: Vec<TaskId>,
    /// Hash of the package's external dependency specs
    pub external_deps_hash: String,
    /// Package-relative directories excluded from file hashing
    pub skip_dirs: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct TrackerState {
    hashes: HashMap<TaskId, String>,
    env_vars: HashMap<TaskId, DetailedMap>,
    expanded_inputs: HashMap<TaskId, BTreeMap<String, String>>,
}

/// Computes and remembers task hashes for one run
#[derive(Debug)]
pub struct TaskHashTracker {
    repo_root: PathBuf,
    global_hash: String,
    env: EnvironmentVariableMap,
    state: Mutex<TrackerState>,
}

impl TaskHashTracker {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        global_hash: impl Into<String>,
        env: EnvironmentVariableMap,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            global_hash: global_hash.into(),
            env,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn global_hash(&self) -> &str {
        &self.global_hash
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Execution-time environment snapshot
    pub fn env(&self) -> &EnvironmentVariableMap {
        &self.env
    }

    /// Compute, record and return the key for `task`.
    ///
    /// Every task in `inputs.dependencies` must already have been hashed.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn calculate_task_hash(
        &self,
        task: &PackageTask,
        inputs: &TaskHashInputs,
    ) -> Result<String, HashError> {
        let definition = &task.definition;
        let package_dir = self.repo_root.join(&task.dir);

        let file_hashes =
            hash_package_files(&package_dir, &input_globs(definition), &inputs.skip_dirs)?;
        let hash_of_files = hash_of(&file_hashes)?;

        // loose mode without declared env tracks the whole environment
        let env_vars = if task.env_mode == EnvMode::Loose && definition.env.is_empty() {
            DetailedMap {
                all: self.env.clone(),
                ..DetailedMap::default()
            }
        } else {
            self.env.hashable_env(&definition.env)?
        };

        let mut task_dependency_hashes = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            inputs
                .dependencies
                .iter()
                .map(|dep| {
                    state
                        .hashes
                        .get(dep)
                        .cloned()
                        .ok_or_else(|| HashError::MissingDependencyHash(dep.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        task_dependency_hashes.sort();
        task_dependency_hashes.dedup();

        let dot_env = match &definition.dot_env {
            Some(files) => hash_dot_env(&package_dir, files)?,
            None => Vec::new(),
        };

        let outputs = task.hashable_outputs();
        let hash = hash_of(&TaskHashable {
            global_hash: &self.global_hash,
            task_dependency_hashes,
            package_dir: task.dir.to_string_lossy().replace('\\', "/"),
            hash_of_files,
            external_deps_hash: &inputs.external_deps_hash,
            task: &task.id.task,
            command: task.command.as_deref(),
            outputs: &outputs,
            pass_through_args: &task.pass_through_args,
            env: &definition.env,
            resolved_env_vars: env_vars.all.to_hashable(),
            pass_through_env: definition.pass_through_env.as_deref(),
            env_mode: task.env_mode,
            dot_env,
        })?;

        debug!(hash = %hash, files = file_hashes.len(), "Calculated task hash");

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hashes.insert(task.id.clone(), hash.clone());
        state.env_vars.insert(task.id.clone(), env_vars);
        state.expanded_inputs.insert(task.id.clone(), file_hashes);
        Ok(hash)
    }

    pub fn hash(&self, id: &TaskId) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hashes.get(id).cloned()
    }

    pub fn env_vars(&self, id: &TaskId) -> Option<DetailedMap> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.env_vars.get(id).cloned()
    }

    pub fn expanded_inputs(&self, id: &TaskId) -> Option<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.expanded_inputs.get(id).cloned()
    }
}
