//! Local file standing in for the remote
//!
//! Serves ranges straight out of a file on disk. Used for `file://` and
//! plain-path URLs, and as a test double for the sync engine.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use zsync2_core::{ByteRange, FetchError, RangeReader, RemoteFetcher};

/// Range fetcher over a local file
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    path: PathBuf,
    expected_length: Option<u64>,
}

impl LocalFetcher {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            expected_length: None,
        }
    }

    /// Reject ranges if the file is not exactly `length` bytes long
    #[must_use]
    pub fn with_expected_length(mut self, length: u64) -> Self {
        self.expected_length = Some(length);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RemoteFetcher for LocalFetcher {
    async fn fetch(&self, range: ByteRange) -> Result<RangeReader, FetchError> {
        let io_err = |source| FetchError::Io {
            url: self.describe(),
            source,
        };

        let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        let size_ok = self.expected_length.is_none_or(|expected| expected == len);
        if range.end() > len || !size_ok {
            return Err(FetchError::RangeMismatch {
                url: self.describe(),
                start: range.start,
                end: range.last(),
                got: format!("file of {len} bytes"),
            });
        }

        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(io_err)?;
        Ok(Box::pin(file.take(range.length)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use zsync2_core::read_range;

    use super::*;

    #[tokio::test]
    async fn test_local_fetch_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("remote.bin");
        std::fs::write(&path, b"hello, world").unwrap();

        let fetcher = LocalFetcher::new(&path);
        let data = read_range(&fetcher, ByteRange::new(7, 5)).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn test_local_range_past_end() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("remote.bin");
        std::fs::write(&path, b"short").unwrap();

        let fetcher = LocalFetcher::new(&path);
        let result = fetcher.fetch(ByteRange::new(3, 10)).await;
        assert!(matches!(result, Err(FetchError::RangeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_local_changed_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("remote.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let fetcher = LocalFetcher::new(&path).with_expected_length(12);
        let result = fetcher.fetch(ByteRange::new(0, 4)).await;
        assert!(matches!(result, Err(FetchError::RangeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_local_missing_file() {
        let temp = TempDir::new().unwrap();
        let fetcher = LocalFetcher::new(temp.path().join("nope"));
        let result = fetcher.fetch(ByteRange::new(0, 1)).await;
        assert!(matches!(result, Err(FetchError::Io { .. })));
    }
}
