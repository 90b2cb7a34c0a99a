//! Cache item archive codec
//!
//! A cache item is a tar stream, optionally zstd-compressed (chosen by the
//! `.tar.zst` extension), holding anchor-relative entries for regular files,
//! directories and symlinks. Writers stream into a temporary file next to the
//! destination and only rename it into place on [`CacheWriter::close`].

mod create;
mod dir_tree;
mod restore;

use std::path::{Component, Path, PathBuf};

use crate::error::{CacheError, Result};

pub use create::CacheWriter;
pub use restore::CacheReader;

/// Whether a cache item path uses zstd compression
pub(crate) fn is_compressed(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".zst"))
}

/// Convert an anchor-relative path to its archive entry name (`/` separated).
pub(crate) fn entry_name(path: &Path) -> Result<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => segments.push(
                segment
                    .to_str()
                    .ok_or_else(|| CacheError::MalformedName(path.display().to_string()))?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => return Err(CacheError::MalformedName(path.display().to_string())),
        }
    }
    if segments.is_empty() {
        return Err(CacheError::MalformedName(path.display().to_string()));
    }
    Ok(segments.join("/"))
}

/// Validate an archive entry name and turn it back into a relative path.
///
/// Absolute names and names containing `..` are rejected so that restoring
/// can never write outside the anchor.
pub(crate) fn checked_relative_path(name: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(segment) => relative.push(segment),
            Component::CurDir => {}
            _ => return Err(CacheError::MalformedName(name.display().to_string())),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(CacheError::MalformedName(name.display().to_string()));
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_entry_name_uses_forward_slashes() {
        let path: PathBuf = ["packages", "web", "dist", "index.js"].iter().collect();
        assert_eq!(entry_name(&path).unwrap(), "packages/web/dist/index.js");
    }

    #[test]
    fn test_entry_name_rejects_escape() {
        assert!(matches!(
            entry_name(Path::new("../outside")),
            Err(CacheError::MalformedName(_))
        ));
        assert!(entry_name(Path::new("/abs/path")).is_err());
        assert!(entry_name(Path::new(".")).is_err());
    }

    #[test]
    fn test_checked_relative_path() {
        assert_eq!(
            checked_relative_path(Path::new("./dist/a.js")).unwrap(),
            PathBuf::from("dist/a.js")
        );
        assert!(checked_relative_path(Path::new("dist/../../etc/passwd")).is_err());
    }

    #[test]
    fn test_is_compressed() {
        assert!(is_compressed(Path::new("/cache/abc.tar.zst")));
        assert!(!is_compressed(Path::new("/cache/abc.tar")));
    }

    fn build_fixture(anchor: &Path) -> Vec<PathBuf> {
        fs::create_dir_all(anchor.join("dist/nested")).unwrap();
        fs::create_dir_all(anchor.join("dist/empty")).unwrap();
        fs::write(anchor.join("dist/index.js"), b"console.log('hi')").unwrap();
        fs::write(anchor.join("dist/nested/deep.txt"), b"deep").unwrap();
        let mut files = vec![
            PathBuf::from("dist"),
            PathBuf::from("dist/empty"),
            PathBuf::from("dist/index.js"),
            PathBuf::from("dist/nested"),
            PathBuf::from("dist/nested/deep.txt"),
        ];
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::write(anchor.join("dist/run.sh"), b"#!/bin/sh\necho run\n").unwrap();
            fs::set_permissions(anchor.join("dist/run.sh"), fs::Permissions::from_mode(0o755))
                .unwrap();
            std::os::unix::fs::symlink("index.js", anchor.join("dist/link.js")).unwrap();
            files.push(PathBuf::from("dist/run.sh"));
            files.push(PathBuf::from("dist/link.js"));
        }
        files
    }

    fn round_trip(archive_name: &str) {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let files = build_fixture(source.path());

        let archive = cache.path().join(archive_name);
        let mut writer = CacheWriter::create(&archive).unwrap();
        for file in &files {
            writer.add_file(source.path(), file).unwrap();
        }
        writer.close().unwrap();

        let restored = CacheReader::open(&archive)
            .unwrap()
            .restore(dest.path())
            .unwrap();
        assert_eq!(restored.len(), files.len());

        assert_eq!(
            fs::read(dest.path().join("dist/index.js")).unwrap(),
            b"console.log('hi')"
        );
        assert_eq!(fs::read(dest.path().join("dist/nested/deep.txt")).unwrap(), b"deep");
        assert!(dest.path().join("dist/empty").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.path().join("dist/run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);

            let link = dest.path().join("dist/link.js");
            assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
            assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("index.js"));
            assert_eq!(fs::read(&link).unwrap(), b"console.log('hi')");
        }
    }

    #[test]
    fn test_round_trip_plain_tar() {
        round_trip("item.tar");
    }

    #[test]
    fn test_round_trip_zstd() {
        round_trip("item.tar.zst");
    }
}
