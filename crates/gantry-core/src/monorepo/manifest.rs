//! Package manifests: `package.json` and `Cargo.toml`
//!
//! Both formats are reduced to the same [`Manifest`] so detection and
//! discovery never look at format-specific structures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, WorkspaceError};

/// On-disk manifest format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    PackageJson,
    Cargo,
}

/// Which half of a manifest is being read.
///
/// A Cargo workspace root keeps its shared dependencies and scripts under
/// `[workspace]`, apart from its own `[package]`. For `package.json` both
/// roles read the same fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManifestRole {
    Root,
    Member,
}

/// What gantry needs from a manifest
#[derive(Debug, Default)]
pub(crate) struct Manifest {
    pub path: PathBuf,
    pub name: Option<String>,
    pub version: Option<String>,
    pub scripts: BTreeMap<String, String>,
    /// Every dependency section merged, name to spec
    pub dependencies: BTreeMap<String, String>,
    /// Member globs (`!` excludes) when the manifest declares a workspace
    pub members: Option<Vec<String>>,
}

impl ManifestFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::PackageJson => "package.json",
            Self::Cargo => "Cargo.toml",
        }
    }
}

impl Manifest {
    /// Read the manifest in `dir`; `None` when there is no such file
    pub(crate) fn load(dir: &Path, format: ManifestFormat, role: ManifestRole) -> Result<Option<Self>> {
        let path = dir.join(format.file_name());
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let invalid = |message: String| WorkspaceError::InvalidManifest {
            path: path.clone(),
            message,
        };
        let mut manifest = match format {
            ManifestFormat::PackageJson => serde_json::from_str::<PackageJson>(&content)
                .map(Self::from)
                .map_err(|e| invalid(e.to_string()))?,
            ManifestFormat::Cargo => toml::from_str::<CargoToml>(&content)
                .map(|cargo| cargo.into_manifest(role))
                .map_err(|e| invalid(e.to_string()))?,
        };
        manifest.path = path;
        Ok(Some(manifest))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    optional_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    peer_dependencies: BTreeMap<String, String>,
    workspaces: Option<NpmWorkspaces>,
}

/// `"workspaces": [...]` or Yarn's `"workspaces": {"packages": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum NpmWorkspaces {
    List(Vec<String>),
    Object {
        #[serde(default)]
        packages: Vec<String>,
    },
}

impl From<PackageJson> for Manifest {
    fn from(pkg: PackageJson) -> Self {
        let mut dependencies = BTreeMap::new();
        // earlier sections win when a name appears twice
        for section in [
            pkg.dependencies,
            pkg.dev_dependencies,
            pkg.optional_dependencies,
            pkg.peer_dependencies,
        ] {
            for (name, spec) in section {
                dependencies.entry(name).or_insert(spec);
            }
        }
        Self {
            path: PathBuf::new(),
            name: pkg.name,
            version: pkg.version,
            scripts: pkg.scripts,
            dependencies,
            members: pkg.workspaces.map(|w| match w {
                NpmWorkspaces::List(members) => members,
                NpmWorkspaces::Object { packages } => packages,
            }),
        }
    }
}

#[derive(Deserialize)]
struct CargoToml {
    package: Option<CargoPackage>,
    workspace: Option<CargoWorkspace>,
    #[serde(default)]
    dependencies: BTreeMap<String, toml::Value>,
    #[serde(default, rename = "dev-dependencies")]
    dev_dependencies: BTreeMap<String, toml::Value>,
    #[serde(default, rename = "build-dependencies")]
    build_dependencies: BTreeMap<String, toml::Value>,
}

#[derive(Deserialize)]
struct CargoPackage {
    name: String,
    /// A string, or `{ workspace = true }`
    version: Option<toml::Value>,
    metadata: Option<CargoMetadata>,
}

#[derive(Deserialize)]
struct CargoWorkspace {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, toml::Value>,
    metadata: Option<CargoMetadata>,
}

/// `[package.metadata.gantry]` / `[workspace.metadata.gantry]`
#[derive(Deserialize)]
struct CargoMetadata {
    gantry: Option<GantryScripts>,
}

#[derive(Deserialize)]
struct GantryScripts {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

fn gantry_scripts(metadata: Option<CargoMetadata>) -> BTreeMap<String, String> {
    metadata
        .and_then(|m| m.gantry)
        .map(|g| g.scripts)
        .unwrap_or_default()
}

impl CargoToml {
    fn into_manifest(self, role: ManifestRole) -> Manifest {
        let members = self.workspace.as_ref().map(|ws| {
            ws.members
                .iter()
                .cloned()
                .chain(ws.exclude.iter().map(|e| format!("!{}", e)))
                .collect()
        });
        let (name, version, package_metadata) = match self.package {
            Some(pkg) => (
                Some(pkg.name),
                pkg.version.and_then(|v| v.as_str().map(str::to_string)),
                pkg.metadata,
            ),
            None => (None, None, None),
        };

        let (scripts, dependencies) = match (role, self.workspace) {
            (ManifestRole::Root, Some(ws)) => (
                gantry_scripts(ws.metadata),
                cargo_specs(ws.dependencies),
            ),
            _ => {
                let mut dependencies = BTreeMap::new();
                for section in [self.dependencies, self.dev_dependencies, self.build_dependencies] {
                    for (name, spec) in cargo_specs(section) {
                        dependencies.entry(name).or_insert(spec);
                    }
                }
                (gantry_scripts(package_metadata), dependencies)
            }
        };

        Manifest {
            path: PathBuf::new(),
            name,
            version,
            scripts,
            dependencies,
            members,
        }
    }
}

/// Cargo dependency entries as `name -> spec` strings.
///
/// A table entry is keyed by its `package` rename when present, and its spec
/// lists the version and source keys so moving a dependency to another
/// source changes the spec.
fn cargo_specs(section: BTreeMap<String, toml::Value>) -> BTreeMap<String, String> {
    const SOURCE_KEYS: [&str; 6] = ["version", "path", "git", "rev", "branch", "tag"];

    section
        .into_iter()
        .map(|(key, value)| match value {
            toml::Value::String(version) => (key, version),
            toml::Value::Table(table) => {
                let name = table
                    .get("package")
                    .and_then(toml::Value::as_str)
                    .map_or(key, str::to_string);
                let spec = SOURCE_KEYS
                    .iter()
                    .filter_map(|k| table.get(*k).and_then(toml::Value::as_str).map(|v| format!("{}={}", k, v)))
                    .collect::<Vec<_>>()
                    .join(",");
                (name, spec)
            }
            other => (key, other.to_string()),
        })
        .collect()
}
