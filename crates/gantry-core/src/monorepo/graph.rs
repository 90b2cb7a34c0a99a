//! Package catalog with workspace dependency edges

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, WorkspaceError};

use super::discovery::{DiscoveredPackage, ROOT_PKG_NAME};

/// Every package of the workspace, indexed by name.
///
/// Construction rejects dependency cycles, so anything built on top of the
/// graph can assume package edges form a DAG.
#[derive(Debug, Clone)]
pub struct PackageGraph {
    root: PathBuf,
    packages: BTreeMap<String, DiscoveredPackage>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl PackageGraph {
    /// Index `packages` and check their workspace edges for cycles
    pub fn build(root: impl Into<PathBuf>, packages: &[DiscoveredPackage]) -> Result<Self> {
        let graph = Self {
            root: root.into(),
            packages: packages
                .iter()
                .map(|pkg| (pkg.name.clone(), pkg.clone()))
                .collect(),
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(WorkspaceError::CyclicDependency(cycle.join(" -> ")).into());
        }
        Ok(graph)
    }

    /// First cycle in name order, closed by repeating its first package
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: BTreeMap<&str, Mark> = self
            .packages
            .keys()
            .map(|name| (name.as_str(), Mark::Unvisited))
            .collect();
        let mut stack = Vec::new();

        for name in self.packages.keys() {
            if marks[name.as_str()] == Mark::Unvisited {
                if let Some(cycle) = self.visit(name, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(name, Mark::InProgress);
        stack.push(name);

        for dep in self.dependencies(name) {
            match marks.get(dep).copied() {
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Mark::Unvisited) => {
                    if let Some(cycle) = self.visit(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
                // done, or not a package of this workspace
                _ => {}
            }
        }

        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package(&self, name: &str) -> Option<&DiscoveredPackage> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Names of all packages, sorted, including `//` when present
    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Number of packages, excluding the root pseudo-package
    pub fn len(&self) -> usize {
        self.packages.keys().filter(|n| *n != ROOT_PKG_NAME).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the workspace is a single package (no `//` pseudo-package)
    pub fn is_single_package(&self) -> bool {
        !self.packages.contains_key(ROOT_PKG_NAME)
    }

    /// Direct workspace dependencies of a package, sorted
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .packages
            .get(name)
            .map(|pkg| pkg.workspace_dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}
