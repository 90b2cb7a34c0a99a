//! Package discovery: expanding member globs into packages

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WorkspaceError};

use super::manifest::{Manifest, ManifestRole};
use super::workspace::Workspace;

/// Name of the pseudo-package that represents the repository root
pub const ROOT_PKG_NAME: &str = "//";

/// A package found in the workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredPackage {
    pub name: String,
    pub version: String,
    /// Absolute package directory
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    /// Task name to shell command
    pub scripts: BTreeMap<String, String>,
    /// Other packages of this workspace it depends on, sorted
    pub workspace_dependencies: Vec<String>,
    /// Everything else it depends on, name to version spec
    pub external_dependencies: BTreeMap<String, String>,
}

impl DiscoveredPackage {
    /// Directory of the package relative to the workspace root
    pub fn relative_path(&self, root: &Path) -> PathBuf {
        self.path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.path.clone())
    }

    /// Shell command for a task, if this package defines one
    pub fn script(&self, task: &str) -> Option<&str> {
        self.scripts.get(task).map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_PKG_NAME
    }
}

/// A package before its dependencies are split into workspace and external
struct Unresolved {
    package: DiscoveredPackage,
    dependencies: BTreeMap<String, String>,
}

impl Unresolved {
    fn from_manifest(name: String, dir: PathBuf, manifest: Manifest) -> Self {
        Self {
            package: DiscoveredPackage {
                name,
                version: manifest.version.unwrap_or_else(|| "0.0.0".to_string()),
                path: dir,
                manifest_path: manifest.path,
                scripts: manifest.scripts,
                ..DiscoveredPackage::default()
            },
            dependencies: manifest.dependencies,
        }
    }
}

impl Workspace {
    /// Every package matched by the member globs, sorted by name.
    ///
    /// A multi-package workspace also yields the `//` pseudo-package built
    /// from the root manifest. Directories under `node_modules` and
    /// manifests without a name are ignored.
    pub fn discover_packages(&self) -> Result<Vec<DiscoveredPackage>> {
        let format = self.workspace_type.manifest_format();
        let mut found: BTreeMap<String, Unresolved> = BTreeMap::new();

        for dir in self.member_dirs()? {
            let Some(manifest) = Manifest::load(&dir, format, ManifestRole::Member)? else {
                continue;
            };
            let Some(name) = manifest.name.clone() else {
                debug!(dir = %dir.display(), "Skipping unnamed package");
                continue;
            };
            if let Some(existing) = found.get(&name) {
                return Err(WorkspaceError::DuplicatePackage {
                    name,
                    first: existing.package.path.clone(),
                    second: dir,
                }
                .into());
            }
            found.insert(name.clone(), Unresolved::from_manifest(name, dir, manifest));
        }

        if !self.is_single_package {
            let manifest = Manifest::load(&self.root, format, ManifestRole::Root)?.unwrap_or_default();
            let root = Unresolved::from_manifest(ROOT_PKG_NAME.to_string(), self.root.clone(), manifest);
            found.insert(ROOT_PKG_NAME.to_string(), root);
        }

        let names: BTreeSet<String> = found.keys().cloned().collect();
        let packages: Vec<DiscoveredPackage> = found
            .into_values()
            .map(|unresolved| resolve_dependencies(unresolved, &names))
            .collect();

        info!(count = packages.len(), workspace_type = %self.workspace_type, "Discovered packages");
        Ok(packages)
    }

    /// Directories matched by the include globs and not by any exclude glob
    fn member_dirs(&self) -> Result<BTreeSet<PathBuf>> {
        let invalid = |pattern: &str, message: String| WorkspaceError::InvalidPattern {
            pattern: pattern.to_string(),
            message,
        };

        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for pattern in &self.package_patterns {
            match pattern.strip_prefix('!') {
                Some(excluded) => excludes.push(
                    Pattern::new(excluded.trim_end_matches('/'))
                        .map_err(|e| invalid(pattern.as_str(), e.to_string()))?,
                ),
                None => includes.push(pattern.trim_end_matches('/')),
            }
        }

        let mut dirs = BTreeSet::new();
        for pattern in includes {
            if pattern == "." {
                dirs.insert(self.root.clone());
                continue;
            }
            let full = self.root.join(pattern);
            let matches = glob::glob(&full.to_string_lossy()).map_err(|e| invalid(pattern, e.to_string()))?;
            for entry in matches {
                let dir = entry.map_err(|e| invalid(pattern, e.to_string()))?;
                if !dir.is_dir() || dir.components().any(|c| c.as_os_str() == "node_modules") {
                    continue;
                }
                let relative = dir.strip_prefix(&self.root).unwrap_or(&dir);
                if excludes.iter().any(|p| p.matches_path(relative)) {
                    continue;
                }
                dirs.insert(dir);
            }
        }
        Ok(dirs)
    }
}

/// Split raw dependencies into workspace edges and external specs
fn resolve_dependencies(unresolved: Unresolved, names: &BTreeSet<String>) -> DiscoveredPackage {
    let Unresolved {
        mut package,
        dependencies,
    } = unresolved;
    for (name, spec) in dependencies {
        if name == package.name || name.is_empty() {
            continue;
        }
        if names.contains(&name) {
            package.workspace_dependencies.push(name);
        } else {
            package.external_dependencies.insert(name, spec);
        }
    }
    package
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn discover(root: &Path) -> Result<Vec<DiscoveredPackage>> {
        Workspace::detect(root).unwrap().unwrap().discover_packages()
    }

    #[test]
    fn test_cargo_workspace_packages() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "Cargo.toml",
            "[workspace]\nmembers = [\"crates/*\"]\n\n[workspace.metadata.gantry.scripts]\nfmt = \"cargo fmt --all\"\n",
        );
        write(
            temp.path(),
            "crates/pkg-a/Cargo.toml",
            "[package]\nname = \"pkg-a\"\nversion = \"1.0.0\"\n\n[package.metadata.gantry.scripts]\nbuild = \"cargo build -p pkg-a\"\n\n[dependencies]\nserde = \"1\"\n",
        );
        write(
            temp.path(),
            "crates/pkg-b/Cargo.toml",
            "[package]\nname = \"pkg-b\"\n\n[dependencies]\npkg-a = { path = \"../pkg-a\" }\n",
        );

        let packages = discover(temp.path()).unwrap();
        let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["//", "pkg-a", "pkg-b"]);

        assert_eq!(packages[0].script("fmt"), Some("cargo fmt --all"));
        assert_eq!(packages[1].script("build"), Some("cargo build -p pkg-a"));
        assert_eq!(packages[1].external_dependencies["serde"], "1");
        assert_eq!(packages[2].version, "0.0.0");
        assert_eq!(packages[2].workspace_dependencies, vec!["pkg-a"]);
        assert!(packages[2].external_dependencies.is_empty());
    }

    #[test]
    fn test_npm_workspace_with_exclusion() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"name": "repo", "workspaces": ["packages/*", "!packages/ignored"], "scripts": {"lint": "eslint ."}}"#,
        );
        write(
            temp.path(),
            "packages/core/package.json",
            r#"{"name": "@my/core", "version": "1.0.0", "scripts": {"build": "tsc"}}"#,
        );
        write(
            temp.path(),
            "packages/utils/package.json",
            r#"{"name": "@my/utils", "dependencies": {"@my/core": "workspace:*", "lodash": "^4.17.21"}}"#,
        );
        write(temp.path(), "packages/ignored/package.json", r#"{"name": "ignored"}"#);
        write(temp.path(), "packages/unnamed/package.json", r#"{"private": true}"#);

        let packages = discover(temp.path()).unwrap();
        let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["//", "@my/core", "@my/utils"]);

        let utils = &packages[2];
        assert_eq!(utils.workspace_dependencies, vec!["@my/core"]);
        assert!(utils.external_dependencies.contains_key("lodash"));
        assert_eq!(utils.relative_path(temp.path()), PathBuf::from("packages/utils"));
        assert_eq!(packages[0].script("lint"), Some("eslint ."));
    }

    #[test]
    fn test_single_package_has_no_root_pseudo_package() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"name": "solo", "version": "0.1.0", "scripts": {"build": "vite build"}}"#,
        );

        let packages = discover(temp.path()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "solo");
        assert_eq!(packages[0].path, temp.path());
    }

    #[test]
    fn test_pnpm_root_without_package_json() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "pnpm-workspace.yaml", "packages:\n  - 'apps/*'\n");
        write(temp.path(), "apps/site/package.json", r#"{"name": "site"}"#);
        write(temp.path(), "apps/site/node_modules/dep/package.json", r#"{"name": "dep"}"#);

        let packages = discover(temp.path()).unwrap();
        let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["//", "site"]);
        assert!(packages[0].scripts.is_empty());
    }

    #[test]
    fn test_duplicate_package_names_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "package.json", r#"{"name": "root", "workspaces": ["a/*"]}"#);
        write(temp.path(), "a/one/package.json", r#"{"name": "same"}"#);
        write(temp.path(), "a/two/package.json", r#"{"name": "same"}"#);

        let err = discover(temp.path()).unwrap_err();
        assert!(err.to_string().contains("Duplicate package name 'same'"));
    }

    #[test]
    fn test_broken_member_manifest_is_an_error() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "package.json", r#"{"name": "root", "workspaces": ["a/*"]}"#);
        write(temp.path(), "a/bad/package.json", "{");

        let err = discover(temp.path()).unwrap_err();
        assert!(matches!(
            err,
            crate::GantryError::Workspace(WorkspaceError::InvalidManifest { .. })
        ));
    }
}
