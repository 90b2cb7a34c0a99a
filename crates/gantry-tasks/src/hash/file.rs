//! File content hashing and glob expansion

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use gantry_core::config::defaults::TASK_LOG_DIR;

use crate::error::HashError;
use crate::task::TaskOutputs;

/// Directories never considered package inputs
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", TASK_LOG_DIR, "target"];

/// SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> Result<String, HashError> {
    let io_err = |source| HashError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compile a glob where `*` and `?` stop at `/`; only `**` crosses directories
pub(crate) fn compile_glob(glob: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(glob).literal_separator(true).build()
}

/// Build a matcher from globs, returning `None` for an empty list
fn build_globset<'a>(globs: impl IntoIterator<Item = &'a String>) -> Result<Option<GlobSet>, HashError> {
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for glob in globs {
        builder.add(compile_glob(glob)?);
        any = true;
    }
    Ok(if any { Some(builder.build()?) } else { None })
}

/// Split `!`-prefixed exclusions out of a glob list and compile both halves
fn build_matchers(globs: &[String]) -> Result<(Option<GlobSet>, Option<GlobSet>), HashError> {
    let exclusions: Vec<String> = globs
        .iter()
        .filter_map(|g| g.strip_prefix('!').map(str::to_string))
        .collect();
    let inclusions = globs.iter().filter(|g| !g.starts_with('!'));
    Ok((build_globset(inclusions)?, build_globset(exclusions.iter())?))
}

/// `dir/**` also excludes `dir` itself
fn with_directory_stems(exclusions: &[String]) -> Vec<String> {
    let mut globs = exclusions.to_vec();
    globs.extend(
        exclusions
            .iter()
            .filter_map(|g| g.strip_suffix("/**"))
            .map(str::to_string),
    );
    globs
}

/// `/`-separated path of `path` relative to `base`
fn unix_relative(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Hash the files of a package, keyed by package-relative path.
///
/// Files ignored by `.gitignore` (in the package or any parent) never count,
/// with or without a git checkout. With no `inputs` every other file counts.
/// `skip` lists package-relative directories that belong to someone else
/// (nested packages of the root).
#[instrument(skip_all, fields(dir = %package_dir.display(), inputs = inputs.len()))]
pub fn hash_package_files(
    package_dir: &Path,
    inputs: &[String],
    skip: &[PathBuf],
) -> Result<BTreeMap<String, String>, HashError> {
    let (include, exclude) = build_matchers(inputs)?;
    let mut hashes = BTreeMap::new();

    let skipped: Vec<PathBuf> = skip.iter().map(|s| package_dir.join(s)).collect();
    let walker = WalkBuilder::new(package_dir)
        .hidden(false)
        .git_global(false)
        .require_git(false)
        .follow_links(false)
        .filter_entry(move |e| {
            if e.depth() == 0 || !e.file_type().is_some_and(|t| t.is_dir()) {
                return true;
            }
            !IGNORED_DIRS.contains(&e.file_name().to_string_lossy().as_ref())
                && !skipped.iter().any(|s| e.path() == s)
        })
        .build();

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(rel) = unix_relative(package_dir, entry.path()) else {
            continue;
        };
        if include.as_ref().is_some_and(|set| !set.is_match(&rel)) {
            continue;
        }
        if exclude.as_ref().is_some_and(|set| set.is_match(&rel)) {
            continue;
        }
        hashes.insert(rel, hash_file(entry.path())?);
    }

    debug!(files = hashes.len(), "Hashed package files");
    Ok(hashes)
}

/// Hash files matching repo-relative globs
pub fn hash_globs(root: &Path, globs: &[String]) -> Result<BTreeMap<String, String>, HashError> {
    if globs.iter().all(|g| g.starts_with('!')) {
        return Ok(BTreeMap::new());
    }
    hash_package_files(root, globs, &[])
}

/// Hash `.env` files in load order; missing files are skipped
pub fn hash_dot_env(dir: &Path, files: &[String]) -> Result<Vec<(String, String)>, HashError> {
    let mut hashes = Vec::with_capacity(files.len());
    for name in files {
        let path = dir.join(name);
        if path.is_file() {
            hashes.push((name.clone(), hash_file(&path)?));
        }
    }
    Ok(hashes)
}

/// Files and directories under `package_dir` matching the output globs,
/// returned relative to `root`. Symlinks are listed, never followed, and
/// excluded directories are pruned along with everything below them.
pub fn expand_outputs(
    root: &Path,
    package_dir: &Path,
    outputs: &TaskOutputs,
) -> Result<Vec<PathBuf>, HashError> {
    let Some(include) = build_globset(outputs.inclusions.iter())? else {
        return Ok(Vec::new());
    };
    let exclude = build_globset(with_directory_stems(&outputs.exclusions).iter())?;
    let base = root.join(package_dir);
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let excluded = |path: &Path| {
        exclude.as_ref().is_some_and(|set| {
            unix_relative(&base, path).is_some_and(|rel| set.is_match(&rel))
        })
    };

    let mut files = Vec::new();
    let walker = WalkDir::new(&base)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !excluded(e.path()));
    for entry in walker {
        let entry = entry?;
        let Some(rel) = unix_relative(&base, entry.path()) else {
            continue;
        };
        if include.is_match(&rel) {
            if let Ok(repo_rel) = entry.path().strip_prefix(root) {
                files.push(repo_rel.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "src/index.ts", "export {}");
        write(temp.path(), "src/util.ts", "export const x = 1");
        write(temp.path(), "README.md", "# pkg");
        write(temp.path(), "node_modules/dep/index.js", "ignored");
        write(temp.path(), ".gantry/gantry-build.log", "ignored");
        temp
    }

    #[test]
    fn test_hash_file_matches_known_digest() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "abc");
        assert_eq!(
            hash_file(&temp.path().join("a.txt")).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_package_files_default_to_everything() {
        let temp = fixture();
        let hashes = hash_package_files(temp.path(), &[], &[]).unwrap();
        let names: Vec<&str> = hashes.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["README.md", "src/index.ts", "src/util.ts"]);
    }

    #[test]
    fn test_package_files_respect_inputs() {
        let temp = fixture();
        let inputs = vec!["src/**".to_string(), "!src/util.ts".to_string()];
        let hashes = hash_package_files(temp.path(), &inputs, &[]).unwrap();
        let names: Vec<&str> = hashes.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["src/index.ts"]);
    }

    #[test]
    fn test_package_files_skip_nested_packages() {
        let temp = fixture();
        write(temp.path(), "packages/web/index.ts", "web");
        let hashes =
            hash_package_files(temp.path(), &[], &[PathBuf::from("packages/web")]).unwrap();
        assert!(!hashes.contains_key("packages/web/index.ts"));
        assert!(hashes.contains_key("README.md"));
    }

    #[test]
    fn test_content_change_changes_hash() {
        let temp = fixture();
        let before = hash_package_files(temp.path(), &[], &[]).unwrap();
        write(temp.path(), "src/util.ts", "export const x = 2");
        let after = hash_package_files(temp.path(), &[], &[]).unwrap();
        assert_ne!(before["src/util.ts"], after["src/util.ts"]);
        assert_eq!(before["src/index.ts"], after["src/index.ts"]);
    }

    #[test]
    fn test_dot_env_keeps_order() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), ".env.local", "A=1");
        write(temp.path(), ".env", "A=0");
        let files = vec![".env.local".to_string(), ".env".to_string(), ".env.missing".to_string()];
        let hashes = hash_dot_env(temp.path(), &files).unwrap();
        let names: Vec<&str> = hashes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![".env.local", ".env"]);
    }

    #[test]
    fn test_expand_outputs() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "apps/web/dist/app.js", "app");
        write(temp.path(), "apps/web/dist/cache/x", "x");
        write(temp.path(), "apps/web/src/app.ts", "src");
        fs::create_dir_all(temp.path().join("apps/web/dist/empty")).unwrap();

        let outputs = TaskOutputs::from_globs(&["dist/**".to_string(), "!dist/cache/**".to_string()]);
        let files = expand_outputs(temp.path(), Path::new("apps/web"), &outputs).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("apps/web/dist/app.js"),
                PathBuf::from("apps/web/dist/empty"),
            ]
        );
    }

    #[test]
    fn test_expand_outputs_prunes_excluded_directory() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "dist/app.js", "app");
        write(temp.path(), "dist/cache/deep/x", "x");

        let outputs = TaskOutputs::from_globs(&["dist/**".to_string(), "!dist/cache/**".to_string()]);
        let files = expand_outputs(temp.path(), Path::new(""), &outputs).unwrap();
        assert_eq!(files, vec![PathBuf::from("dist/app.js")]);
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let temp = fixture();
        write(temp.path(), "src/nested/deep.ts", "nested");

        let shallow = hash_package_files(temp.path(), &["src/*.ts".to_string()], &[]).unwrap();
        let names: Vec<&str> = shallow.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["src/index.ts", "src/util.ts"]);

        let deep = hash_package_files(temp.path(), &["src/**/*.ts".to_string()], &[]).unwrap();
        assert!(deep.contains_key("src/nested/deep.ts"));
    }

    #[test]
    fn test_gitignored_files_are_not_inputs() {
        let temp = fixture();
        write(temp.path(), ".gitignore", "dist\n*.tsbuildinfo\n");
        let before = hash_package_files(temp.path(), &[], &[]).unwrap();

        write(temp.path(), "dist/index.js", "built");
        write(temp.path(), "tsconfig.tsbuildinfo", "{}");
        let after = hash_package_files(temp.path(), &[], &[]).unwrap();

        assert_eq!(before, after);
        assert!(after.contains_key(".gitignore"));
    }

    #[test]
    fn test_hidden_files_are_inputs() {
        let temp = fixture();
        write(temp.path(), ".eslintrc.json", "{}");
        let hashes = hash_package_files(temp.path(), &[], &[]).unwrap();
        assert!(hashes.contains_key(".eslintrc.json"));
    }
}
