//! Workspace catalog for multi-package repositories
//!
//! Detection finds the workspace root and its member globs, discovery turns
//! those globs into packages, and [`PackageGraph`] indexes the packages and
//! rejects dependency cycles.

pub mod discovery;
pub mod graph;
pub mod manifest;
pub mod workspace;

pub use discovery::{DiscoveredPackage, ROOT_PKG_NAME};
pub use graph::PackageGraph;
pub use manifest::ManifestFormat;
pub use workspace::{Workspace, WorkspaceType};
