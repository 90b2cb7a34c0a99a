//! Resolves a graph node into a hashed [`PackageTask`] and hands it to a runner

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};

use gantry_core::{Config, EnvMode, PackageGraph};

use crate::dag::TaskGraph;
use crate::engine::Visitor;
use crate::error::{HashError, TaskError};
use crate::hash::{hash_of, TaskHashInputs, TaskHashTracker};
use crate::runner::TaskRunner;
use crate::summary::TaskSummary;
use crate::task::{PackageTask, TaskId};

/// Scripts at the root matching this would run gantry recursively
const SELF_INVOCATION_PATTERN: &str = r"(?:^|\s)gantry(?:$|\s)";

/// Per-run visitor settings
#[derive(Debug, Clone, Default)]
pub struct VisitorOptions {
    /// Tasks requested on the command line, as `task` or `pkg#task`
    pub targets: Vec<String>,
    /// Arguments after `--`, given to target tasks only
    pub pass_through_args: Vec<String>,
    /// Dependency edges are ignored for this run
    pub parallel: bool,
}

/// The engine's visitor for real runs and dry runs alike
pub struct PackageTaskVisitor {
    config: Arc<Config>,
    packages: Arc<PackageGraph>,
    graph: Arc<TaskGraph>,
    tracker: Arc<TaskHashTracker>,
    runner: Arc<dyn TaskRunner>,
    opts: VisitorOptions,
    self_invocation: Regex,
}

impl PackageTaskVisitor {
    pub fn new(
        config: Arc<Config>,
        packages: Arc<PackageGraph>,
        graph: Arc<TaskGraph>,
        tracker: Arc<TaskHashTracker>,
        runner: Arc<dyn TaskRunner>,
        opts: VisitorOptions,
    ) -> Result<Self, TaskError> {
        let self_invocation = Regex::new(SELF_INVOCATION_PATTERN)
            .map_err(|e| TaskError::Internal(e.to_string()))?;
        Ok(Self {
            config,
            packages,
            graph,
            tracker,
            runner,
            opts,
            self_invocation,
        })
    }

    /// `infer` becomes strict when pass-through patterns are declared
    fn resolve_env_mode(&self, task_pass_through: Option<&Vec<String>>) -> EnvMode {
        match self.config.env_mode {
            EnvMode::Infer => {
                if task_pass_through.is_some() || self.config.global_pass_through_env.is_some() {
                    EnvMode::Strict
                } else {
                    EnvMode::Loose
                }
            }
            mode => mode,
        }
    }

    /// Directories of other packages nested under the root package
    /// Whether `id` was requested directly, by task name or as `pkg#task`
    fn is_target(&self, id: &TaskId) -> bool {
        self.opts
            .targets
            .iter()
            .any(|t| TaskId::parse(t).map_or(t == &id.task, |target| &target == id))
    }

    fn nested_package_dirs(&self) -> Vec<PathBuf> {
        let root = self.packages.root();
        self.packages
            .package_names()
            .filter_map(|name| self.packages.package(name))
            .filter(|p| !p.is_root())
            .map(|p| p.relative_path(root))
            .collect()
    }
}

#[async_trait]
impl Visitor for PackageTaskVisitor {
    #[instrument(skip_all, fields(task = %id))]
    async fn visit(&self, id: TaskId) -> Result<(), TaskError> {
        let package = self
            .packages
            .package(&id.package)
            .ok_or_else(|| TaskError::MissingPackage {
                package: id.package.clone(),
                task: id.clone(),
            })?;

        let command = package.script(&id.task).map(str::to_string);
        if id.is_root_package() {
            if let Some(command) = &command {
                if self.self_invocation.is_match(command) {
                    return Err(TaskError::SelfInvocation {
                        task: id,
                        command: command.clone(),
                    });
                }
            }
        }

        let definition = self
            .graph
            .definition(&id)
            .cloned()
            .ok_or_else(|| TaskError::MissingDefinition(id.clone()))?;
        let env_mode = self.resolve_env_mode(definition.pass_through_env.as_ref());

        let pass_through_args = if self.is_target(&id) {
            self.opts.pass_through_args.clone()
        } else {
            Vec::new()
        };

        let dependencies = if self.opts.parallel {
            Vec::new()
        } else {
            self.graph.dependencies_of(&id)
        };
        let hash_inputs = TaskHashInputs {
            dependencies,
            external_deps_hash: hash_of(&package.external_dependencies)?,
            skip_dirs: if id.is_root_package() {
                self.nested_package_dirs()
            } else {
                Vec::new()
            },
        };

        let mut task = PackageTask {
            id: id.clone(),
            dir: package.relative_path(self.packages.root()),
            command,
            definition,
            env_mode,
            hash: String::new(),
            pass_through_args,
        };

        let tracker = self.tracker.clone();
        let to_hash = task.clone();
        let inputs = hash_inputs.clone();
        task.hash = tokio::task::spawn_blocking(move || tracker.calculate_task_hash(&to_hash, &inputs))
            .await
            .map_err(|e| TaskError::Internal(format!("hashing {} panicked: {}", id, e)))??;
        debug!(hash = %task.hash, env_mode = %task.env_mode, "Task hashed");

        let env = self.tracker.env_vars(&id).unwrap_or_default();
        let mut summary = TaskSummary::new(
            &task,
            self.tracker.expanded_inputs(&id).unwrap_or_default(),
            hash_inputs.external_deps_hash,
            &env,
            self.graph.ancestors(&id).into_iter().collect(),
            self.graph.descendants(&id).into_iter().collect(),
        );
        if let Some(patterns) = &task.definition.pass_through_env {
            let matched = self
                .tracker
                .env()
                .wildcard_matches(patterns)
                .map_err(HashError::from)?;
            summary.environment_variables.passthrough = Some(matched.to_secret_hashable());
        }

        self.runner.run(task, summary).await
    }

    fn blocked(&self, task: &TaskId) {
        self.runner.blocked(task);
    }
}
