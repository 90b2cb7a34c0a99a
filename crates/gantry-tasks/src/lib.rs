//! Gantry Tasks - Task graph, hashing and execution
//!
//! This crate turns a package graph and pipeline config into a task graph,
//! hashes each task's inputs deterministically and walks the graph with
//! bounded parallelism, restoring outputs from the cache where it can.

pub mod daemon;
pub mod dag;
pub mod dry_run;
pub mod engine;
pub mod env;
pub mod error;
pub mod hash;
pub mod reporter;
pub mod runner;
pub mod summary;
pub mod task;
pub mod visitor;

pub use daemon::{OutputTracker, OutputWatcher};
pub use dag::{TaskGraph, TaskNode};
pub use dry_run::{populate_cache_state, DryRunRunner};
pub use engine::{
    ContinuationPolicy, Engine, ExecutionError, ExecutionOptions, FnVisitor, Visitor,
};
pub use env::{DetailedMap, EnvironmentVariableMap};
pub use error::{EnvError, GraphError, HashError, TaskError};
pub use hash::{GlobalHashInputs, GlobalHashSummary, TaskHashTracker};
pub use reporter::{TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use runner::{RunOptions, ShellTaskRunner, TaskRunner};
pub use summary::{ExecutionSummary, RunSummary, TaskSummary};
pub use task::{PackageTask, TaskDefinition, TaskId, TaskOutputs};
pub use visitor::{PackageTaskVisitor, VisitorOptions};
