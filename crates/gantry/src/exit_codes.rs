//! Exit codes for the CLI

use gantry_core::{ConfigError, GantryError, WorkspaceError};
use gantry_tasks::GraphError;

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// Task or package graph could not be built
pub const GRAPH_ERROR: i32 = 3;

/// At least one task failed
pub const TASK_FAILED: i32 = 4;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Pick the exit code for an error that escaped a command
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return CONFIG_ERROR;
        }
        if cause.is::<GraphError>() {
            return GRAPH_ERROR;
        }
        if let Some(err) = cause.downcast_ref::<GantryError>() {
            return match err {
                GantryError::Config(_) | GantryError::Toml(_) => CONFIG_ERROR,
                GantryError::Workspace(WorkspaceError::CyclicDependency(_)) => GRAPH_ERROR,
                _ => ERROR,
            };
        }
    }
    ERROR
}
