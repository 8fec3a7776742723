//! Remote range retrieval
//!
//! The sync engine only needs "give me these bytes of the target". HTTP is
//! one answer; a local file standing in for the remote is another.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chunks::ByteRange;
use crate::error::FetchError;

/// Body of a fetched range
pub type RangeReader = Pin<Box<dyn AsyncRead + Send>>;

/// Source of byte ranges of the target file
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Open a reader positioned at `range.start`.
    ///
    /// The reader yields at least `range.length` bytes unless the source is
    /// short; callers read exactly `range.length`.
    async fn fetch(&self, range: ByteRange) -> Result<RangeReader, FetchError>;

    /// Human-readable location, for logs and errors
    fn describe(&self) -> String;
}

/// Fetch `range` and read it completely into memory
///
/// # Errors
/// Returns the fetch error, an I/O error while reading, or
/// [`FetchError::ShortBody`] if fewer than `range.length` bytes arrive.
pub async fn read_range<F>(fetcher: &F, range: ByteRange) -> Result<Bytes, FetchError>
where
    F: RemoteFetcher + ?Sized,
{
    let reader = fetcher.fetch(range).await?;
    read_body(reader, range, &fetcher.describe()).await
}

/// Read exactly `range.length` bytes of a range body; anything past that
/// is left unread.
///
/// # Errors
/// Returns an I/O error while reading, or [`FetchError::ShortBody`] if the
/// body ends early.
pub async fn read_body<R>(reader: R, range: ByteRange, url: &str) -> Result<Bytes, FetchError>
where
    R: AsyncRead + Unpin,
{
    let short = |got: usize| FetchError::ShortBody {
        url: url.to_string(),
        expected: range.length,
        got: got as u64,
    };
    let expected = usize::try_from(range.length).map_err(|_| short(0))?;

    let mut buf = BytesMut::with_capacity(expected);
    let mut limited = reader.take(range.length);
    while buf.len() < expected {
        let n = limited
            .read_buf(&mut buf)
            .await
            .map_err(|source| FetchError::Io {
                url: url.to_string(),
                source,
            })?;
        if n == 0 {
            break;
        }
    }

    if buf.len() < expected {
        return Err(short(buf.len()));
    }
    Ok(buf.freeze())
}
