//! Workspace root detection

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

use super::manifest::{Manifest, ManifestFormat, ManifestRole};

/// Package manager conventions a workspace follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    Cargo,
    Npm,
    Pnpm,
    Yarn,
}

impl WorkspaceType {
    /// Manifest format of every package in this workspace
    pub fn manifest_format(self) -> ManifestFormat {
        match self {
            Self::Cargo => ManifestFormat::Cargo,
            Self::Npm | Self::Pnpm | Self::Yarn => ManifestFormat::PackageJson,
        }
    }

    /// Lockfile pinning external dependencies; part of the global hash
    pub fn lockfile_name(self) -> &'static str {
        match self {
            Self::Cargo => "Cargo.lock",
            Self::Npm => "package-lock.json",
            Self::Pnpm => "pnpm-lock.yaml",
            Self::Yarn => "yarn.lock",
        }
    }
}

impl std::fmt::Display for WorkspaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cargo => "cargo",
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
        };
        f.write_str(name)
    }
}

/// A repository root and where its packages live
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub workspace_type: WorkspaceType,
    /// Globs relative to `root`; `!` prefixes an exclusion
    pub package_patterns: Vec<String>,
    /// The root manifest is the only package
    pub is_single_package: bool,
}

#[derive(Deserialize)]
struct PnpmWorkspaceFile {
    #[serde(default)]
    packages: Vec<String>,
}

impl Workspace {
    pub fn new(root: PathBuf, workspace_type: WorkspaceType) -> Self {
        Self {
            root,
            workspace_type,
            package_patterns: Vec::new(),
            is_single_package: false,
        }
    }

    fn single(root: &Path, workspace_type: WorkspaceType) -> Self {
        Self {
            package_patterns: vec![".".to_string()],
            is_single_package: true,
            ..Self::new(root.to_path_buf(), workspace_type)
        }
    }

    /// Look for a workspace rooted exactly at `dir`.
    ///
    /// `pnpm-workspace.yaml` wins over `package.json`, which wins over
    /// `Cargo.toml`. A manifest without member globs but with a name is a
    /// single-package workspace. Unparseable root manifests are skipped
    /// with a warning so a broken file in some ancestor directory never
    /// stops detection.
    pub fn detect(dir: &Path) -> Result<Option<Self>> {
        if let Some(patterns) = read_pnpm_workspace(dir)? {
            debug!(root = %dir.display(), "Detected pnpm workspace");
            return Ok(Some(Self {
                package_patterns: patterns,
                ..Self::new(dir.to_path_buf(), WorkspaceType::Pnpm)
            }));
        }

        for format in [ManifestFormat::PackageJson, ManifestFormat::Cargo] {
            let manifest = match Manifest::load(dir, format, ManifestRole::Root) {
                Ok(Some(manifest)) => manifest,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable root manifest");
                    continue;
                }
            };
            let workspace_type = match format {
                ManifestFormat::Cargo => WorkspaceType::Cargo,
                ManifestFormat::PackageJson if dir.join("yarn.lock").is_file() => WorkspaceType::Yarn,
                ManifestFormat::PackageJson => WorkspaceType::Npm,
            };

            if let Some(members) = manifest.members {
                debug!(root = %dir.display(), %workspace_type, "Detected workspace");
                return Ok(Some(Self {
                    package_patterns: members,
                    ..Self::new(dir.to_path_buf(), workspace_type)
                }));
            }
            if manifest.name.is_some() {
                debug!(root = %dir.display(), %workspace_type, "Detected single package");
                return Ok(Some(Self::single(dir, workspace_type)));
            }
        }
        Ok(None)
    }

    /// Path of the lockfile, if one exists on disk
    pub fn lockfile(&self) -> Option<PathBuf> {
        let path = self.root.join(self.workspace_type.lockfile_name());
        path.is_file().then_some(path)
    }
}

/// Member globs from `pnpm-workspace.yaml`; an empty or invalid file falls
/// back to `packages/*`
fn read_pnpm_workspace(dir: &Path) -> Result<Option<Vec<String>>> {
    let path = dir.join("pnpm-workspace.yaml");
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let packages = match serde_yaml::from_str::<Option<PnpmWorkspaceFile>>(&content) {
        Ok(file) => file.map(|f| f.packages).unwrap_or_default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid pnpm-workspace.yaml");
            Vec::new()
        }
    };
    if packages.is_empty() {
        return Ok(Some(vec!["packages/*".to_string()]));
    }
    Ok(Some(packages))
}
