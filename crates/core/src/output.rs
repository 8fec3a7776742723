//! Positioned-write output sink
//!
//! Writes carry their own offset, so several tasks can fill disjoint ranges
//! of the same file through a shared reference without a cursor to fight
//! over.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// A sink that accepts writes at arbitrary offsets
pub trait PositionedWrite {
    /// Write all of `buf` starting at `offset`
    ///
    /// # Errors
    /// Returns the underlying I/O error
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
}

/// Output file for a reconstruction
#[derive(Debug)]
pub struct OutputFile {
    file: File,
}

impl OutputFile {
    /// Create `path`, truncating any existing file
    ///
    /// # Errors
    /// Returns an error if the file cannot be created
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Wrap an already-open, writable file
    #[must_use]
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    /// Grow or shrink to `len` bytes. Growth reads back as zeros and is
    /// sparse where the filesystem supports it.
    ///
    /// # Errors
    /// Returns the underlying I/O error
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// Current length in bytes
    ///
    /// # Errors
    /// Returns the underlying I/O error
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Flush data and metadata to disk
    ///
    /// # Errors
    /// Returns the underlying I/O error
    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Borrow the underlying file, e.g. to read the result back
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn into_file(self) -> File {
        self.file
    }
}

impl PositionedWrite for OutputFile {
    #[cfg(unix)]
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt as _;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt as _;
        while !buf.is_empty() {
            match self.file.seek_write(buf, offset) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: PositionedWrite + ?Sized> PositionedWrite for &T {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        (**self).write_all_at(buf, offset)
    }
}

impl<T: PositionedWrite + ?Sized> PositionedWrite for std::sync::Arc<T> {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        (**self).write_all_at(buf, offset)
    }
}
