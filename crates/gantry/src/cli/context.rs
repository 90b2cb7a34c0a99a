//! Repository state shared by the commands

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use gantry_core::config::load_config_or_default;
use gantry_core::{Config, PackageGraph, Workspace, ROOT_PKG_NAME};
use gantry_tasks::TaskGraph;

/// Loaded config plus the package graph for the current workspace
pub struct RepoContext {
    pub root: PathBuf,
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub workspace: Workspace,
    pub packages: PackageGraph,
}

impl RepoContext {
    /// Detect the workspace around `cwd`, load its config and discover packages
    pub fn load(cwd: &Path) -> anyhow::Result<Self> {
        let workspace = detect_workspace(cwd)?
            .with_context(|| format!("No workspace found at {}", cwd.display()))?;
        let root = workspace.root.clone();

        let (config, config_path) = load_config_or_default(&root)?;

        let discovered = workspace
            .discover_packages()
            .context("Failed to discover packages")?;
        if discovered.is_empty() {
            anyhow::bail!("No packages found in workspace");
        }

        let packages = PackageGraph::build(root.clone(), &discovered)?;
        debug!(
            root = %root.display(),
            packages = packages.len(),
            config = ?config_path,
            "Loaded workspace"
        );

        Ok(Self {
            root,
            config,
            config_path,
            workspace,
            packages,
        })
    }

    /// Local cache directory, resolved against the repository root
    pub fn cache_dir(&self) -> PathBuf {
        cache_dir(&self.root, &self.config)
    }

    /// Build the task graph for `tasks`, restricted to `filter` packages
    pub fn task_graph(&self, tasks: &[String], filter: &[String]) -> anyhow::Result<TaskGraph> {
        TaskGraph::build(&self.config, &self.packages, tasks, filter)
            .context("Failed to build task graph")
    }

    /// Packages that own at least one task in `graph`
    pub fn packages_in_scope(graph: &TaskGraph) -> Vec<String> {
        graph
            .task_ids()
            .map(|id| id.package.clone())
            .filter(|name| name != ROOT_PKG_NAME)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// The nearest multi-package workspace at or above `cwd`, else the nearest
/// single package
pub fn detect_workspace(cwd: &Path) -> anyhow::Result<Option<Workspace>> {
    let mut nearest_single = None;
    for dir in cwd.ancestors() {
        match Workspace::detect(dir)? {
            Some(workspace) if !workspace.is_single_package => return Ok(Some(workspace)),
            Some(workspace) => {
                nearest_single.get_or_insert(workspace);
            }
            None => {}
        }
    }
    Ok(nearest_single)
}

/// Local cache directory for a repository
pub fn cache_dir(root: &Path, config: &Config) -> PathBuf {
    if config.cache.dir.is_absolute() {
        config.cache.dir.clone()
    } else {
        root.join(&config.cache.dir)
    }
}
