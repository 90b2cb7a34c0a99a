//! Directory creation cache used while restoring

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Remembers the most recently ensured directory chain.
///
/// Archive entries are usually grouped by directory, so consecutive entries
/// share a long prefix. Only the segments past the shared prefix need to be
/// checked or created on disk.
pub(crate) struct CachedDirTree {
    /// `anchor_at_depth[i]` is the absolute directory after `i` segments
    anchor_at_depth: Vec<PathBuf>,
    prefix: Vec<OsString>,
}

impl CachedDirTree {
    pub(crate) fn new(anchor: PathBuf) -> Self {
        Self {
            anchor_at_depth: vec![anchor],
            prefix: Vec::new(),
        }
    }

    /// Number of leading segments already known to exist
    fn shared_depth(&self, segments: &[OsString]) -> usize {
        self.prefix
            .iter()
            .zip(segments)
            .take_while(|(known, wanted)| known == wanted)
            .count()
    }

    /// Make sure the anchor-relative directory exists and return its
    /// absolute path.
    pub(crate) fn ensure_dir(&mut self, relative: &Path) -> io::Result<PathBuf> {
        let segments: Vec<OsString> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_os_string()),
                _ => None,
            })
            .collect();

        let depth = self.shared_depth(&segments);
        self.prefix.truncate(depth);
        self.anchor_at_depth.truncate(depth + 1);

        let mut current = self.anchor_at_depth[depth].clone();
        for segment in &segments[depth..] {
            current.push(segment);
            safe_mkdir(&current)?;
            self.anchor_at_depth.push(current.clone());
            self.prefix.push(segment.clone());
        }
        Ok(current)
    }
}

/// Create one directory level without ever following a symlink out of the
/// anchor. A link sitting where a directory belongs is replaced by a real
/// directory.
fn safe_mkdir(path: &Path) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let meta = fs::symlink_metadata(path)?;
            if meta.file_type().is_symlink() {
                remove_link(path)?;
                fs::create_dir(path)
            } else if meta.is_dir() {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", path.display()),
                ))
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn remove_link(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

// directory symlinks on Windows are removed like directories
#[cfg(windows)]
fn remove_link(path: &Path) -> io::Result<()> {
    fs::remove_file(path).or_else(|_| fs::remove_dir(path))
}
