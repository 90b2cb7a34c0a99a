//! Task graph construction
//!
//! Nodes live in an arena indexed by `usize`. Index 0 is a synthetic root
//! that every task without dependencies points at, so every edge target is
//! either a real task or the root. Real tasks are numbered in sorted
//! [`TaskId`] order, which keeps walks over the graph deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::{debug, info, instrument};

use gantry_core::{Config, PackageGraph, ROOT_PKG_NAME};

use crate::error::GraphError;
use crate::task::{TaskDefinition, TaskId};

/// Name of the synthetic root node
pub const ROOT_NODE_NAME: &str = "___ROOT___";

/// Arena index of the synthetic root
pub const ROOT_INDEX: usize = 0;

/// A node in the task graph
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Task identifier
    pub id: TaskId,
    /// Indices of the tasks that must complete before this one
    pub dependencies: Vec<usize>,
    /// Indices of the tasks waiting on this one
    pub dependents: Vec<usize>,
    /// Execution wave (tasks in the same wave can run in parallel)
    pub wave: usize,
}

/// Directed acyclic graph of tasks to execute
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<TaskId, usize>,
    definitions: HashMap<TaskId, TaskDefinition>,
    waves: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Build the task graph for `targets` across `packages`.
    ///
    /// `filter` restricts which packages the targets start from (empty means
    /// all); dependencies are followed into any package. A target of the
    /// form `pkg#task` names one exact task.
    #[instrument(skip_all, fields(targets = ?targets, filter = filter.len()))]
    pub fn build(
        config: &Config,
        packages: &PackageGraph,
        targets: &[String],
        filter: &[String],
    ) -> Result<Self, GraphError> {
        let mut queue: VecDeque<(TaskId, Option<TaskId>)> = VecDeque::new();

        for target in targets {
            if let Some(id) = TaskId::parse(target) {
                if !packages.contains(&id.package) {
                    return Err(GraphError::TaskNotFound(target.clone()));
                }
                queue.push_back((id, None));
                continue;
            }

            if !config.has_task(target) {
                return Err(GraphError::TaskNotFound(target.clone()));
            }
            for package in packages.package_names() {
                if !filter.is_empty() && !filter.iter().any(|f| f == package) {
                    continue;
                }
                let id = TaskId::new(package, target.as_str());
                // packages without an entry for a requested task simply don't run it
                if definition_for(config, &id).is_some() {
                    queue.push_back((id, None));
                }
            }
        }

        let mut definitions: HashMap<TaskId, TaskDefinition> = HashMap::new();
        let mut edges: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();

        while let Some((id, required_by)) = queue.pop_front() {
            if definitions.contains_key(&id) {
                continue;
            }
            let definition = definition_for(config, &id).ok_or_else(|| {
                GraphError::MissingTaskDefinition {
                    task: id.clone(),
                    required_by: required_by.clone(),
                }
            })?;

            let mut deps = BTreeSet::new();
            for task in &definition.topological_dependencies {
                for package in packages.dependencies(&id.package) {
                    deps.insert(TaskId::new(package, task.as_str()));
                }
            }
            for rule in &definition.task_dependencies {
                let dep = match TaskId::parse(rule) {
                    Some(dep) => {
                        if !packages.contains(&dep.package) {
                            return Err(GraphError::UnknownPackage {
                                package: dep.package,
                                required_by: id.clone(),
                            });
                        }
                        dep
                    }
                    None => TaskId::new(id.package.as_str(), rule.as_str()),
                };
                deps.insert(dep);
            }

            for dep in &deps {
                if let Some(dep_def) = definition_for(config, dep) {
                    let has_script = packages
                        .package(&dep.package)
                        .is_some_and(|p| p.script(&dep.task).is_some());
                    if dep_def.persistent && has_script {
                        return Err(GraphError::PersistentDependency {
                            dependency: dep.clone(),
                            dependent: id.clone(),
                        });
                    }
                }
                queue.push_back((dep.clone(), Some(id.clone())));
            }

            debug!(task = %id, deps = deps.len(), "Resolved task dependencies");
            edges.insert(id.clone(), deps);
            definitions.insert(id, definition);
        }

        let graph = Self::from_edges(edges, definitions)?;
        info!(
            task_count = graph.len(),
            wave_count = graph.waves.len(),
            "Task graph built"
        );
        Ok(graph)
    }

    /// Lay out the arena and check for cycles
    fn from_edges(
        edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
        definitions: HashMap<TaskId, TaskDefinition>,
    ) -> Result<Self, GraphError> {
        let mut nodes = vec![TaskNode {
            id: TaskId::new("", ROOT_NODE_NAME),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            wave: 0,
        }];
        let mut index = HashMap::new();
        for id in edges.keys() {
            index.insert(id.clone(), nodes.len());
            nodes.push(TaskNode {
                id: id.clone(),
                dependencies: Vec::new(),
                dependents: Vec::new(),
                wave: 0,
            });
        }

        for (id, deps) in &edges {
            let from = index[id];
            let mut targets: Vec<usize> = deps.iter().filter_map(|d| index.get(d).copied()).collect();
            if targets.is_empty() {
                targets.push(ROOT_INDEX);
            }
            targets.sort_unstable();
            for &to in &targets {
                nodes[to].dependents.push(from);
            }
            nodes[from].dependencies = targets;
        }
        for node in &mut nodes {
            node.dependents.sort_unstable();
        }

        let mut graph = Self {
            nodes,
            index,
            definitions,
            waves: Vec::new(),
        };
        let order = graph.topological_order()?;
        graph.compute_waves(&order);
        Ok(graph)
    }

    /// Kahn's algorithm over real tasks; reports a cycle if one remains
    fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut remaining: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.dependencies.iter().filter(|&&d| d != ROOT_INDEX).count())
            .collect();
        let mut queue: VecDeque<usize> = (1..self.nodes.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dependent in &self.nodes[i].dependents {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() + 1 != self.nodes.len() {
            let cycle = self.find_cycle(&remaining);
            return Err(GraphError::Cycle(cycle));
        }
        Ok(order)
    }

    /// Describe one cycle among the nodes Kahn's algorithm could not order
    fn find_cycle(&self, remaining: &[usize]) -> String {
        let stuck: BTreeSet<usize> = (1..self.nodes.len()).filter(|&i| remaining[i] > 0).collect();
        let Some(&start) = stuck.iter().next() else {
            return String::new();
        };

        // every stuck node has a stuck dependency, so following them must revisit a node
        let mut path = vec![start];
        let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let next = self.nodes[current]
                .dependencies
                .iter()
                .copied()
                .find(|d| stuck.contains(d));
            let Some(next) = next else {
                break;
            };
            if let Some(&at) = position.get(&next) {
                let mut members: Vec<String> =
                    path[at..].iter().map(|&i| self.nodes[i].id.to_string()).collect();
                members.push(self.nodes[next].id.to_string());
                return members.join(" -> ");
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }

        stuck
            .iter()
            .map(|&i| self.nodes[i].id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn compute_waves(&mut self, order: &[usize]) {
        for &i in order {
            let wave = self.nodes[i]
                .dependencies
                .iter()
                .filter(|&&d| d != ROOT_INDEX)
                .map(|&d| self.nodes[d].wave + 1)
                .max()
                .unwrap_or(0);
            self.nodes[i].wave = wave;
        }

        let max_wave = order.iter().map(|&i| self.nodes[i].wave).max();
        let mut waves = vec![Vec::new(); max_wave.map_or(0, |w| w + 1)];
        for i in 1..self.nodes.len() {
            waves[self.nodes[i].wave].push(i);
        }
        self.waves = waves;
    }

    /// All arena nodes, the synthetic root included
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Get a node by arena index
    pub fn node(&self, index: usize) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    /// Arena index of a task
    pub fn index_of(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Whether a task is part of the graph
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Resolved definition of a task in the graph
    pub fn definition(&self, id: &TaskId) -> Option<&TaskDefinition> {
        self.definitions.get(id)
    }

    /// Task ids in arena (sorted) order
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.nodes.iter().skip(1).map(|n| &n.id)
    }

    /// Number of real tasks
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct dependencies of a task, excluding the synthetic root
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, |n| &n.dependencies)
    }

    /// Direct dependents of a task
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, |n| &n.dependents)
    }

    fn neighbours(&self, id: &TaskId, edges: impl Fn(&TaskNode) -> &Vec<usize>) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&i) => edges(&self.nodes[i])
                .iter()
                .filter(|&&j| j != ROOT_INDEX)
                .map(|&j| self.nodes[j].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task this task transitively depends on
    pub fn ancestors(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.reachable(id, |n| &n.dependencies)
    }

    /// Every task that transitively depends on this task
    pub fn descendants(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.reachable(id, |n| &n.dependents)
    }

    fn reachable(&self, id: &TaskId, edges: impl Fn(&TaskNode) -> &Vec<usize>) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        let mut visited = vec![false; self.nodes.len()];
        while let Some(i) = queue.pop_front() {
            for &j in edges(&self.nodes[i]) {
                if j != ROOT_INDEX && !visited[j] {
                    visited[j] = true;
                    seen.insert(self.nodes[j].id.clone());
                    queue.push_back(j);
                }
            }
        }
        seen
    }

    /// Tasks grouped by execution wave
    pub fn waves(&self) -> Vec<Vec<&TaskId>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|&i| &self.nodes[i].id).collect())
            .collect()
    }

    /// Get a human-readable summary of the execution plan
    pub fn execution_plan(&self, packages: &PackageGraph) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} tasks):\n", i, wave.len()));
            for &index in wave {
                let id = &self.nodes[index].id;
                let command = packages
                    .package(&id.package)
                    .and_then(|p| p.script(&id.task))
                    .unwrap_or(crate::task::MISSING_TASK_LABEL);
                let deps = self.dependencies_of(id);
                if deps.is_empty() {
                    plan.push_str(&format!("  {} -> {}\n", id, command));
                } else {
                    let deps: Vec<String> = deps.iter().map(ToString::to_string).collect();
                    plan.push_str(&format!(
                        "  {} -> {} (after: {})\n",
                        id,
                        command,
                        deps.join(", ")
                    ));
                }
            }
        }
        plan
    }
}

/// Pipeline entry for a task id. Root tasks only exist when named explicitly.
fn definition_for(config: &Config, id: &TaskId) -> Option<TaskDefinition> {
    let entry = if id.package == ROOT_PKG_NAME {
        config.pipeline.get(&id.to_string())
    } else {
        config.task_config(&id.package, &id.task)
    };
    entry.map(TaskDefinition::from)
}
