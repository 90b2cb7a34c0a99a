//! Run and task summaries

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use gantry_cache::{CacheSource, ItemStatus};
use gantry_core::EnvMode;

use crate::env::DetailedMap;
use crate::hash::GlobalHashSummary;
use crate::task::{PackageTask, TaskDefinition, TaskId, MISSING_TASK_LABEL};

/// Cache state of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub local: bool,
    pub remote: bool,
    /// `HIT` or `MISS`
    pub status: &'static str,
    pub source: Option<CacheSource>,
    pub time_saved: u64,
}

impl CacheSummary {
    pub fn miss() -> Self {
        Self {
            status: "MISS",
            ..Self::default()
        }
    }
}

impl From<ItemStatus> for CacheSummary {
    fn from(status: ItemStatus) -> Self {
        if !status.hit {
            return Self::miss();
        }
        Self {
            local: status.source == Some(CacheSource::Fs),
            remote: status.source == Some(CacheSource::Remote),
            status: "HIT",
            source: status.source,
            time_saved: status.time_saved,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvSummary {
    pub specified: SpecifiedTaskEnv,
    pub configured: Vec<String>,
    pub inferred: Vec<String>,
    pub passthrough: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecifiedTaskEnv {
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
}

/// Everything known about one task after hashing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub task: String,
    pub package: String,
    pub hash: String,
    /// Package-relative input files and their hashes
    pub inputs: BTreeMap<String, String>,
    pub hash_of_external_dependencies: String,
    pub cache: CacheSummary,
    pub command: String,
    pub cli_arguments: Vec<String>,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub directory: String,
    pub dependencies: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    pub resolved_task_definition: TaskDefinition,
    pub env_mode: EnvMode,
    pub environment_variables: TaskEnvSummary,
}

impl TaskSummary {
    /// Summary of a hashed task; the cache state starts as a miss
    pub fn new(
        task: &PackageTask,
        inputs: BTreeMap<String, String>,
        external_deps_hash: String,
        env: &DetailedMap,
        dependencies: Vec<TaskId>,
        dependents: Vec<TaskId>,
    ) -> Self {
        let definition = &task.definition;
        Self {
            task_id: task.id.clone(),
            task: task.id.task.clone(),
            package: task.id.package.clone(),
            hash: task.hash.clone(),
            inputs,
            hash_of_external_dependencies: external_deps_hash,
            cache: CacheSummary::miss(),
            command: task
                .command
                .clone()
                .unwrap_or_else(|| MISSING_TASK_LABEL.to_string()),
            cli_arguments: task.pass_through_args.clone(),
            outputs: definition.outputs.inclusions.clone(),
            excluded_outputs: definition.outputs.exclusions.clone(),
            log_file: task.log_file().to_string_lossy().replace('\\', "/"),
            directory: task.dir.to_string_lossy().replace('\\', "/"),
            dependencies,
            dependents,
            resolved_task_definition: definition.clone(),
            env_mode: task.env_mode,
            environment_variables: TaskEnvSummary {
                specified: SpecifiedTaskEnv {
                    env: definition.env.clone(),
                    pass_through_env: definition.pass_through_env.clone(),
                },
                configured: env.by_source.explicit.to_secret_hashable(),
                inferred: env.by_source.matching.to_secret_hashable(),
                // filled in by the caller, which owns the env snapshot
                passthrough: None,
            },
        }
    }
}

/// Outcome counters for a real run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
}

/// The full report of a run or dry run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub global_cache_inputs: GlobalHashSummary,
    pub packages: Vec<String>,
    pub env_mode: EnvMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSummary>,
    pub tasks: Vec<TaskSummary>,
}

impl RunSummary {
    pub fn new(
        global_cache_inputs: GlobalHashSummary,
        packages: Vec<String>,
        env_mode: EnvMode,
        tasks: Vec<TaskSummary>,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            id: started_at.format("%Y%m%dT%H%M%S%3f").to_string(),
            version: env!("CARGO_PKG_VERSION"),
            started_at,
            global_cache_inputs,
            packages,
            env_mode,
            execution: None,
            tasks,
        }
    }

    pub fn with_execution(mut self, execution: ExecutionSummary) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text rendering used by `--dry-run=text`
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Packages in scope");
        for package in &self.packages {
            let _ = writeln!(out, "  {}", package);
        }

        let _ = writeln!(out, "\nGlobal hash inputs");
        let global = &self.global_cache_inputs;
        let _ = writeln!(out, "  Global files                   = {}", global.files.len());
        let _ = writeln!(
            out,
            "  External dependencies hash     = {}",
            global.hash_of_external_dependencies
        );
        let _ = writeln!(
            out,
            "  Global .env files              = {}",
            global.global_dot_env.join(", ")
        );
        let _ = writeln!(
            out,
            "  Global env                     = {}",
            global.environment_variables.specified.env.join(", ")
        );
        let _ = writeln!(out, "  Environment mode               = {}", self.env_mode);

        let _ = writeln!(out, "\nTasks to run");
        for task in &self.tasks {
            let _ = writeln!(out, "{}", task.task_id);
            let rows: [(&str, String); 10] = [
                ("Task", task.task.clone()),
                ("Package", task.package.clone()),
                ("Hash", task.hash.clone()),
                ("Cached (Local)", task.cache.local.to_string()),
                ("Cached (Remote)", task.cache.remote.to_string()),
                ("Directory", task.directory.clone()),
                ("Command", task.command.clone()),
                ("Outputs", task.outputs.join(", ")),
                ("Log File", task.log_file.clone()),
                ("Dependencies", join_ids(&task.dependencies)),
            ];
            for (label, value) in rows {
                let _ = writeln!(out, "  {:<30} = {}", label, value);
            }
            let _ = writeln!(out, "  {:<30} = {}", "Dependents", join_ids(&task.dependents));
            let _ = writeln!(
                out,
                "  {:<30} = {}",
                "Environment Variables",
                task.environment_variables.configured.join(", ")
            );
        }
        out
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
