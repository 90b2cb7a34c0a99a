//! Concurrent, dependency-respecting walk over a [`TaskGraph`]
//!
//! A single driver loop owns the per-node "remaining predecessors" counters.
//! Visitors run on spawned tasks and report back through a [`JoinSet`]; each
//! completion only touches the direct dependents of the finished node.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{TaskGraph, ROOT_INDEX};
use crate::error::TaskError;
use crate::task::TaskId;

/// Per-task callback driven by the engine
#[async_trait]
pub trait Visitor: Send + Sync {
    async fn visit(&self, task: TaskId) -> Result<(), TaskError>;

    /// Called instead of [`visit`](Self::visit) when a dependency failed
    fn blocked(&self, _task: &TaskId) {}
}

/// Adapts a closure returning a future into a [`Visitor`]
pub struct FnVisitor<F>(pub F);

#[async_trait]
impl<F, Fut> Visitor for FnVisitor<F>
where
    F: Fn(TaskId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn visit(&self, task: TaskId) -> Result<(), TaskError> {
        (self.0)(task).await
    }
}

/// What happens to the dependents of a failed task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContinuationPolicy {
    /// Dependents of a failed task never run
    #[default]
    Block,
    /// A failure counts as completion for scheduling purposes
    Continue,
}

/// Knobs for a single walk
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    /// Maximum visitors in flight
    pub concurrency: usize,
    /// Ignore dependency edges entirely
    pub parallel: bool,
    pub policy: ContinuationPolicy,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            parallel: false,
            policy: ContinuationPolicy::Block,
        }
    }
}

impl ExecutionOptions {
    /// Strict single-threaded topological order
    pub fn serial() -> Self {
        Self {
            concurrency: 1,
            ..Self::default()
        }
    }
}

/// A visitor failure recorded against its task
#[derive(Debug, Error)]
#[error("{task}: {error}")]
pub struct ExecutionError {
    pub task: TaskId,
    pub error: TaskError,
}

/// Drives visitors over a task graph
pub struct Engine {
    graph: Arc<TaskGraph>,
}

impl Engine {
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Walk the graph, returning every failure rather than the first.
    ///
    /// Cancellation and [`TaskError::StopExecution`] stop dispatch; visitors
    /// already running are awaited and their results recorded.
    pub async fn execute(
        &self,
        visitor: Arc<dyn Visitor>,
        opts: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Vec<ExecutionError> {
        let nodes = self.graph.nodes();
        let concurrency = opts.concurrency.max(1);

        let mut remaining: Vec<usize> = nodes
            .iter()
            .map(|n| {
                if opts.parallel {
                    0
                } else {
                    n.dependencies.iter().filter(|&&d| d != ROOT_INDEX).count()
                }
            })
            .collect();
        let mut blocked = vec![false; nodes.len()];
        let mut ready: BinaryHeap<Reverse<usize>> = (1..nodes.len())
            .filter(|&i| remaining[i] == 0)
            .map(Reverse)
            .collect();

        let mut in_flight: JoinSet<Result<(), TaskError>> = JoinSet::new();
        let mut spawned: HashMap<task::Id, usize> = HashMap::new();
        let mut errors = Vec::new();
        let mut stopped = false;

        info!(
            tasks = self.graph.len(),
            concurrency,
            parallel = opts.parallel,
            "Executing task graph"
        );

        loop {
            while !stopped && !cancel.is_cancelled() && in_flight.len() < concurrency {
                let Some(Reverse(index)) = ready.pop() else {
                    break;
                };
                if blocked[index] {
                    info!(task = %nodes[index].id, "Not running: a dependency failed");
                    visitor.blocked(&nodes[index].id);
                    self.complete(index, false, &opts, &mut remaining, &mut blocked, &mut ready);
                    continue;
                }

                let id = nodes[index].id.clone();
                let visitor = visitor.clone();
                let handle = in_flight.spawn(async move { visitor.visit(id).await });
                spawned.insert(handle.id(), index);
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(done) => done,
                // a panicking or aborted visitor fails its own node
                Err(e) => {
                    let error = if e.is_panic() {
                        TaskError::Internal(format!("visitor panicked: {}", e))
                    } else {
                        TaskError::Internal(format!("visitor did not finish: {}", e))
                    };
                    (e.id(), Err(error))
                }
            };
            let Some(index) = spawned.remove(&id) else {
                warn!(task_id = %id, "Joined a task the engine did not spawn");
                continue;
            };

            let ok = match result {
                Ok(()) => true,
                Err(error) => {
                    if error.is_stop() {
                        stopped = true;
                    }
                    errors.push(ExecutionError {
                        task: nodes[index].id.clone(),
                        error: error.into_inner(),
                    });
                    false
                }
            };
            self.complete(index, ok, &opts, &mut remaining, &mut blocked, &mut ready);
        }

        if cancel.is_cancelled() {
            info!("Task execution cancelled");
        }
        debug!(failures = errors.len(), "Task graph walk finished");
        errors
    }

    /// Release the direct dependents of a finished node
    fn complete(
        &self,
        index: usize,
        ok: bool,
        opts: &ExecutionOptions,
        remaining: &mut [usize],
        blocked: &mut [bool],
        ready: &mut BinaryHeap<Reverse<usize>>,
    ) {
        if opts.parallel {
            return;
        }
        let propagate_block = blocked[index] || (!ok && opts.policy == ContinuationPolicy::Block);
        for &dependent in &self.graph.nodes()[index].dependents {
            if propagate_block {
                blocked[dependent] = true;
            }
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
}
