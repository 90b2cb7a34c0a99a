//! Inputs shared by every task in a run

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, instrument};

use gantry_core::{Config, EnvMode};

use crate::env::{DetailedMap, EnvironmentVariableMap};
use crate::error::HashError;

use super::file::{hash_dot_env, hash_file, hash_globs};
use super::hash_of;

/// Bump to invalidate every existing cache entry
const GLOBAL_CACHE_KEY: &str = "gantry global cache key v1";

/// Everything that contributes to the global hash
#[derive(Debug, Clone)]
pub struct GlobalHashInputs {
    /// Global dependency files plus the config file, keyed by repo-relative path
    pub global_file_hash_map: BTreeMap<String, String>,
    /// Hash of the root's external dependencies and the lockfile
    pub root_external_deps_hash: String,
    /// Resolved `globalEnv` variables
    pub env: DetailedMap,
    /// Declared `globalEnv` patterns, sorted
    pub declared_env: Vec<String>,
    /// `globalPassThroughEnv` patterns, sorted
    pub pass_through_env: Option<Vec<String>>,
    /// Values matched by the pass-through patterns; summarized, never hashed
    pub resolved_pass_through: EnvironmentVariableMap,
    pub env_mode: EnvMode,
    /// `globalDotEnv` file hashes in load order
    pub dot_env: Vec<(String, String)>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalHashable<'a> {
    global_cache_key: &'static str,
    global_file_hash_map: &'a BTreeMap<String, String>,
    root_external_deps_hash: &'a str,
    env: Vec<String>,
    pass_through_env: Option<&'a [String]>,
    env_mode: EnvMode,
    dot_env: &'a [(String, String)],
}

/// Collect the global hash inputs for a repository
#[instrument(skip_all, fields(root = %repo_root.display()))]
pub fn get_global_hash_inputs(
    repo_root: &Path,
    config: &Config,
    config_path: Option<&Path>,
    lockfile: Option<&Path>,
    root_external_deps: &BTreeMap<String, String>,
    env: &EnvironmentVariableMap,
) -> Result<GlobalHashInputs, HashError> {
    let mut global_file_hash_map = hash_globs(repo_root, &config.global_dependencies)?;
    if let Some(path) = config_path {
        let key = path
            .strip_prefix(repo_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        global_file_hash_map.insert(key, hash_file(path)?);
    }

    let lockfile_hash = lockfile.map(hash_file).transpose()?;
    let root_external_deps_hash = hash_of(&(root_external_deps, lockfile_hash))?;

    let mut declared_env = config.global_env.clone();
    declared_env.sort();
    let resolved = env.hashable_env(&declared_env)?;

    let pass_through_env = config.global_pass_through_env.clone().map(|mut p| {
        p.sort();
        p
    });
    let resolved_pass_through = match &pass_through_env {
        Some(patterns) => env.wildcard_matches(patterns)?,
        None => EnvironmentVariableMap::default(),
    };

    let dot_env = match &config.global_dot_env {
        Some(files) => hash_dot_env(repo_root, files)?,
        None => Vec::new(),
    };

    debug!(
        files = global_file_hash_map.len(),
        env = resolved.all.len(),
        "Collected global hash inputs"
    );

    Ok(GlobalHashInputs {
        global_file_hash_map,
        root_external_deps_hash,
        env: resolved,
        declared_env,
        pass_through_env,
        resolved_pass_through,
        env_mode: config.env_mode,
        dot_env,
    })
}

/// Digest the global inputs
pub fn calculate_global_hash(inputs: &GlobalHashInputs) -> Result<String, HashError> {
    hash_of(&GlobalHashable {
        global_cache_key: GLOBAL_CACHE_KEY,
        global_file_hash_map: &inputs.global_file_hash_map,
        root_external_deps_hash: &inputs.root_external_deps_hash,
        env: inputs.env.all.to_hashable(),
        pass_through_env: inputs.pass_through_env.as_deref(),
        env_mode: inputs.env_mode,
        dot_env: &inputs.dot_env,
    })
}

/// Secret-safe view of the global inputs for run summaries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub root_key: &'static str,
    pub files: BTreeMap<String, String>,
    pub hash_of_external_dependencies: String,
    pub global_dot_env: Vec<String>,
    pub environment_variables: GlobalEnvSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEnvSummary {
    pub specified: SpecifiedEnv,
    pub configured: Vec<String>,
    pub inferred: Vec<String>,
    pub passthrough: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecifiedEnv {
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
}

impl From<&GlobalHashInputs> for GlobalHashSummary {
    fn from(inputs: &GlobalHashInputs) -> Self {
        Self {
            root_key: GLOBAL_CACHE_KEY,
            files: inputs.global_file_hash_map.clone(),
            hash_of_external_dependencies: inputs.root_external_deps_hash.clone(),
            global_dot_env: inputs.dot_env.iter().map(|(name, _)| name.clone()).collect(),
            environment_variables: GlobalEnvSummary {
                specified: SpecifiedEnv {
                    env: inputs.declared_env.clone(),
                    pass_through_env: inputs.pass_through_env.clone(),
                },
                configured: inputs.env.by_source.explicit.to_secret_hashable(),
                inferred: inputs.env.by_source.matching.to_secret_hashable(),
                passthrough: inputs
                    .pass_through_env
                    .as_ref()
                    .map(|_| inputs.resolved_pass_through.to_secret_hashable()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::TempDir;

    fn env() -> EnvironmentVariableMap {
        [("CI", "true"), ("NODE_ENV", "production"), ("VERCEL_URL", "x")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn inputs(root: &Path, config: &Config, env: &EnvironmentVariableMap) -> GlobalHashInputs {
        get_global_hash_inputs(root, config, None, None, &BTreeMap::new(), env).unwrap()
    }

    fn fixture() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("tsconfig.json"), "{}").unwrap();
        let mut config = Config::default();
        config.global_dependencies = vec!["tsconfig.json".to_string()];
        config.global_env = vec!["NODE_ENV".to_string()];
        (temp, config)
    }

    #[test]
    fn test_global_hash_is_deterministic() {
        let (temp, config) = fixture();
        let a = calculate_global_hash(&inputs(temp.path(), &config, &env())).unwrap();
        let b = calculate_global_hash(&inputs(temp.path(), &config, &env())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_global_env_declaration_order_is_irrelevant() {
        let (temp, mut config) = fixture();
        config.global_env = vec!["NODE_ENV".to_string(), "CI".to_string()];
        let a = calculate_global_hash(&inputs(temp.path(), &config, &env())).unwrap();
        config.global_env = vec!["CI".to_string(), "NODE_ENV".to_string()];
        let b = calculate_global_hash(&inputs(temp.path(), &config, &env())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_global_inputs_change_hash() {
        let (temp, config) = fixture();
        let base = calculate_global_hash(&inputs(temp.path(), &config, &env())).unwrap();

        let mut changed_env = env();
        changed_env.insert("NODE_ENV", "development");
        let env_hash = calculate_global_hash(&inputs(temp.path(), &config, &changed_env)).unwrap();
        assert_ne!(base, env_hash);

        // undeclared variables do not matter
        let mut noise = env();
        noise.insert("RANDOM", "1");
        let noise_hash = calculate_global_hash(&inputs(temp.path(), &config, &noise)).unwrap();
        assert_eq!(base, noise_hash);

        fs::write(temp.path().join("tsconfig.json"), "{\"strict\":true}").unwrap();
        let file_hash = calculate_global_hash(&inputs(temp.path(), &config, &env())).unwrap();
        assert_ne!(base, file_hash);
    }

    #[test]
    fn test_lockfile_contributes() {
        let (temp, config) = fixture();
        let lock = temp.path().join("package-lock.json");
        fs::write(&lock, "v1").unwrap();
        let deps = BTreeMap::from([("react".to_string(), "^18".to_string())]);

        let with_lock = |contents: &str| {
            fs::write(&lock, contents).unwrap();
            let inputs =
                get_global_hash_inputs(temp.path(), &config, None, Some(&lock), &deps, &env())
                    .unwrap();
            calculate_global_hash(&inputs).unwrap()
        };
        assert_ne!(with_lock("v1"), with_lock("v2"));
    }

    #[test]
    fn test_summary_hides_values() {
        let (temp, mut config) = fixture();
        config.global_pass_through_env = Some(vec!["VERCEL_*".to_string()]);
        let summary = GlobalHashSummary::from(&inputs(temp.path(), &config, &env()));

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("rootKey").is_some());
        assert!(json.get("hashOfExternalDependencies").is_some());
        let vars = &json["environmentVariables"];
        assert_eq!(vars["specified"]["env"][0], "NODE_ENV");
        assert_eq!(vars["specified"]["passThroughEnv"][0], "VERCEL_*");
        let configured = vars["configured"][0].as_str().unwrap();
        assert!(configured.starts_with("NODE_ENV="));
        assert!(!configured.contains("production"));
        assert_eq!(vars["passthrough"].as_array().unwrap().len(), 1);
    }
}
