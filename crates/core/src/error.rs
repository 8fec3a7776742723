//! Error types for the sync engine
//!
//! Library callers need to tell a local read failure from a network failure
//! from a corrupt result, so these are typed rather than `eyre::Report`.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by a sync run. All of them abort the sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Scanning a seed file failed
    #[error("failed to read seed {}: {source}", path.display())]
    LocalRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A remote range could not be retrieved
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Seeking, reading a chunk source, or writing the output failed
    #[error("failed to write {len} bytes at offset {offset}: {source}")]
    Write {
        offset: u64,
        len: u64,
        #[source]
        source: io::Error,
    },

    /// A chunk source ran out before a chunk was fully copied
    #[error("chunk source exhausted at offset {offset}: wanted {wanted} more bytes")]
    SourceExhausted { offset: u64, wanted: u64 },

    /// The reconstructed file has the wrong length
    #[error("output length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// The reconstructed file does not hash to the advertised digest
    #[error("SHA-1 mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// The control file is malformed or unsupported
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Preparing or finalising the output file failed
    #[error("output file {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading the finished output back for verification failed
    #[error("failed to read back output: {0}")]
    ReadBack(#[source] io::Error),

    /// A worker task panicked or was cancelled
    #[error("sync task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Errors from a [`RemoteFetcher`](crate::fetch::RemoteFetcher).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The server answered with an unexpected status code
    #[error("{url}: unexpected HTTP status {status}")]
    Status { url: String, status: u16 },

    /// The server ignored the Range header and sent the whole resource
    #[error("{url}: server does not support range requests")]
    RangeNotSupported { url: String },

    /// The server sent a different range, or the resource changed size
    #[error("{url}: requested bytes {start}-{end}, got {got}")]
    RangeMismatch {
        url: String,
        start: u64,
        end: u64,
        got: String,
    },

    /// The body ended before the requested range was complete
    #[error("{url}: range body ended after {got} of {expected} bytes")]
    ShortBody {
        url: String,
        expected: u64,
        got: u64,
    },

    /// Connection or protocol failure below HTTP
    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Reading the fetched body failed
    #[error("{url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Whether retrying the same request might succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Transport { .. } | Self::Io { .. } => true,
            Self::RangeNotSupported { .. }
            | Self::RangeMismatch { .. }
            | Self::ShortBody { .. } => false,
        }
    }
}

/// Errors from parsing or generating a control file.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control file is missing the {0:?} header")]
    MissingHeader(&'static str),

    #[error("invalid {name:?} header value {value:?}")]
    InvalidHeader { name: String, value: String },

    #[error("malformed header line {0:?}")]
    MalformedLine(String),

    #[error("unsupported control file feature: {0}")]
    Unsupported(String),

    #[error("block table truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("{0} unexpected bytes after block table")]
    TrailingData(usize),

    #[error("inconsistent block index: {0}")]
    InvalidIndex(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
