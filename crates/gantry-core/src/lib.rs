//! Gantry Core - configuration and workspace catalog
//!
//! This crate provides the error taxonomy, pipeline configuration loading,
//! and the workspace catalog (package discovery and the package graph) that
//! the task engine builds on.

pub mod config;
pub mod error;
pub mod monorepo;

pub use config::{Config, EnvMode, OutputMode, PipelineTask};
pub use error::{ConfigError, GantryError, Result, WorkspaceError};
pub use monorepo::{DiscoveredPackage, PackageGraph, Workspace, WorkspaceType, ROOT_PKG_NAME};
