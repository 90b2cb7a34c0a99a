//! Cache item writer

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::trace;

use super::{entry_name, is_compressed};
use crate::error::{CacheError, Result};

const ZSTD_LEVEL: i32 = 3;

/// Byte sink behind the tar builder
enum ArchiveSink {
    Plain(NamedTempFile),
    Zstd(zstd::Encoder<'static, NamedTempFile>),
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(file) => file.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(file) => file.flush(),
            Self::Zstd(encoder) => encoder.flush(),
        }
    }
}

impl ArchiveSink {
    fn finish(self) -> io::Result<NamedTempFile> {
        match self {
            Self::Plain(file) => Ok(file),
            Self::Zstd(encoder) => encoder.finish(),
        }
    }
}

/// Streams files into a new cache item.
///
/// Nothing is visible at the destination until [`close`](Self::close)
/// succeeds; a writer dropped before that removes its temporary file.
pub struct CacheWriter {
    builder: tar::Builder<ArchiveSink>,
    destination: PathBuf,
}

impl CacheWriter {
    /// Start a new archive destined for `path`
    pub fn create(path: &Path) -> Result<Self> {
        let dir = path.parent().ok_or_else(|| {
            CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cache item path has no parent: {}", path.display()),
            ))
        })?;
        fs::create_dir_all(dir)?;

        let temp = NamedTempFile::new_in(dir)?;
        let sink = if is_compressed(path) {
            ArchiveSink::Zstd(zstd::Encoder::new(temp, ZSTD_LEVEL)?)
        } else {
            ArchiveSink::Plain(temp)
        };

        let mut builder = tar::Builder::new(sink);
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        Ok(Self {
            builder,
            destination: path.to_path_buf(),
        })
    }

    /// Append one anchor-relative path.
    ///
    /// Directories are recorded as empty entries; their contents must be
    /// added individually.
    pub fn add_file(&mut self, anchor: &Path, file: &Path) -> Result<()> {
        let source = anchor.join(file);
        let metadata = fs::symlink_metadata(&source)?;
        let file_type = metadata.file_type();
        let name = entry_name(file)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(entry_mode(&metadata));

        if file_type.is_symlink() {
            let target = fs::read_link(&source)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            self.builder.append_link(&mut header, &name, &target)?;
        } else if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            self.builder
                .append_data(&mut header, format!("{}/", name), io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            let reader = File::open(&source)?;
            self.builder.append_data(&mut header, &name, reader)?;
        } else {
            return Err(CacheError::UnsupportedFileType(source));
        }

        trace!(entry = %name, "Added cache item entry");
        Ok(())
    }

    /// Finish the archive and move it into place
    pub fn close(self) -> Result<PathBuf> {
        let sink = self.builder.into_inner()?;
        let temp = sink.finish()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.destination)
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(self.destination)
    }
}

#[cfg(unix)]
fn entry_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
