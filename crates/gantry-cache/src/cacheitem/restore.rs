//! Cache item reader

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::trace;

use super::dir_tree::CachedDirTree;
use super::{checked_relative_path, is_compressed};
use crate::error::{CacheError, Result};

/// Opened cache item ready to be restored
pub struct CacheReader {
    archive: tar::Archive<Box<dyn Read + Send>>,
}

impl CacheReader {
    /// Open an archive; compression is chosen from the file name
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn Read + Send> = if is_compressed(path) {
            Box::new(zstd::Decoder::new(file)?)
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(Self::from_reader(reader))
    }

    /// Wrap an already-open tar stream
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self {
            archive: tar::Archive::new(reader),
        }
    }

    /// Materialize every entry under `anchor`.
    ///
    /// Returns the anchor-relative paths that were restored. Symlinks are
    /// created after all files and directories so that their targets are in
    /// place first.
    pub fn restore(mut self, anchor: &Path) -> Result<Vec<PathBuf>> {
        let mut tree = CachedDirTree::new(anchor.to_path_buf());
        let mut restored = Vec::new();
        let mut links = Vec::new();

        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.into_owned();
            let relative = checked_relative_path(&name)?;
            let entry_type = entry.header().entry_type();
            let mode = entry.header().mode()?;

            match entry_type {
                tar::EntryType::Directory => {
                    let dir = tree.ensure_dir(&relative)?;
                    set_mode(&dir, mode)?;
                }
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let parent = relative.parent().unwrap_or(Path::new(""));
                    let dir = tree.ensure_dir(parent)?;
                    let target = match relative.file_name() {
                        Some(file_name) => dir.join(file_name),
                        None => return Err(CacheError::MalformedName(name.display().to_string())),
                    };
                    clear_non_directory(&target)?;
                    let mut out = File::create(&target)?;
                    io::copy(&mut entry, &mut out)?;
                    set_mode(&target, mode)?;
                }
                tar::EntryType::Symlink => {
                    let link_target = entry
                        .link_name()?
                        .ok_or_else(|| CacheError::MalformedName(name.display().to_string()))?
                        .into_owned();
                    links.push((relative, link_target));
                    continue;
                }
                _ => return Err(CacheError::UnsupportedFileType(relative)),
            }

            trace!(entry = %relative.display(), "Restored cache item entry");
            restored.push(relative);
        }

        for (relative, link_target) in links {
            let parent = relative.parent().unwrap_or(Path::new(""));
            let dir = tree.ensure_dir(parent)?;
            let link = match relative.file_name() {
                Some(file_name) => dir.join(file_name),
                None => return Err(CacheError::MalformedName(relative.display().to_string())),
            };
            clear_any(&link)?;
            create_symlink(&link_target, &link)?;
            trace!(entry = %relative.display(), "Restored cache item symlink");
            restored.push(relative);
        }

        Ok(restored)
    }
}

/// Remove a file or symlink occupying `path` so a fresh file is written
/// instead of following an old link.
fn clear_non_directory(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions)
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = link.parent().map(|p| p.join(target));
    if resolved.is_some_and(|p| p.is_dir()) {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheitem::CacheWriter;
    use tempfile::TempDir;

    fn raw_archive(entries: &[(&str, tar::EntryType, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, entry_type, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*entry_type);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            // set_path refuses `..`, so write the raw name bytes directly
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_rejects_parent_escape() {
        let dest = TempDir::new().unwrap();
        let bytes = raw_archive(&[("../evil.txt", tar::EntryType::Regular, b"x")]);
        let reader = CacheReader::from_reader(Box::new(io::Cursor::new(bytes)));
        let err = reader.restore(dest.path()).unwrap_err();
        assert!(matches!(err, CacheError::MalformedName(_)));
        assert!(!dest.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn test_rejects_unsupported_entry_type() {
        let dest = TempDir::new().unwrap();
        let bytes = raw_archive(&[("dev", tar::EntryType::Char, b"")]);
        let reader = CacheReader::from_reader(Box::new(io::Cursor::new(bytes)));
        let err = reader.restore(dest.path()).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedFileType(_)));
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dest = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let path = cache.path().join("bad.tar.zst");
        fs::write(&path, b"definitely not zstd").unwrap();

        let result = CacheReader::open(&path).and_then(|r| r.restore(dest.path()));
        assert!(result.is_err());
    }

    #[test]
    fn test_restore_overwrites_existing_files() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        fs::write(source.path().join("out.txt"), b"new").unwrap();
        fs::write(dest.path().join("out.txt"), b"old contents").unwrap();

        let archive = cache.path().join("h.tar");
        let mut writer = CacheWriter::create(&archive).unwrap();
        writer.add_file(source.path(), Path::new("out.txt")).unwrap();
        writer.close().unwrap();

        CacheReader::open(&archive)
            .unwrap()
            .restore(dest.path())
            .unwrap();
        assert_eq!(fs::read(dest.path().join("out.txt")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_restored_before_its_target_entry() {
        let dest = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        fs::create_dir(source.path().join("lib")).unwrap();
        fs::write(source.path().join("lib/real.js"), b"real").unwrap();
        std::os::unix::fs::symlink("lib/real.js", source.path().join("alias.js")).unwrap();

        // link entry precedes the directory and file it points into
        let archive = cache.path().join("h.tar.zst");
        let mut writer = CacheWriter::create(&archive).unwrap();
        writer.add_file(source.path(), Path::new("alias.js")).unwrap();
        writer.add_file(source.path(), Path::new("lib")).unwrap();
        writer.add_file(source.path(), Path::new("lib/real.js")).unwrap();
        writer.close().unwrap();

        let restored = CacheReader::open(&archive)
            .unwrap()
            .restore(dest.path())
            .unwrap();
        assert_eq!(restored.last().unwrap(), Path::new("alias.js"));
        assert_eq!(fs::read(dest.path().join("alias.js")).unwrap(), b"real");
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_does_not_write_through_existing_symlink() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        fs::create_dir(source.path().join("dist")).unwrap();
        fs::write(source.path().join("dist/app.js"), b"app").unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), dest.path().join("dist")).unwrap();

        let archive = cache.path().join("h.tar.zst");
        let mut writer = CacheWriter::create(&archive).unwrap();
        writer.add_file(source.path(), Path::new("dist")).unwrap();
        writer.add_file(source.path(), Path::new("dist/app.js")).unwrap();
        writer.close().unwrap();

        CacheReader::open(&archive)
            .unwrap()
            .restore(dest.path())
            .unwrap();
        assert_eq!(fs::read(dest.path().join("dist/app.js")).unwrap(), b"app");
        assert!(!elsewhere.path().join("app.js").exists());
        assert!(fs::symlink_metadata(dest.path().join("dist")).unwrap().is_dir());
    }
}
