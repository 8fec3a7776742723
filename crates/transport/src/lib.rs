//! zsync2-transport: where control files and target ranges come from
//!
//! HTTP(S) URLs go through [`HttpFetcher`]; anything else is treated as a
//! local path and served by [`LocalFetcher`].

pub mod http;
pub mod local;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use url::Url;

use zsync2_core::{ControlError, ControlFile, FetchError, RemoteFetcher};

pub use http::{HttpFetcher, HttpOptions};
pub use local::LocalFetcher;

/// Errors from locating or loading a control file
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{0:?} is not a usable local path")]
    InvalidPath(String),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// A control file or target location: an HTTP(S) URL or a local path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Url(Url),
    Path(PathBuf),
}

impl Location {
    /// Classify `s`: `http(s)://` is a URL, `file://` and everything else a path
    ///
    /// # Errors
    /// Returns an error for a `file://` URL that is not a valid local path
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        match Url::parse(s) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Self::Url(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Self::Path)
                .map_err(|()| TransportError::InvalidPath(s.to_string())),
            _ => Ok(Self::Path(PathBuf::from(s))),
        }
    }

    /// Last path segment, e.g. to derive an output file name
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Url(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .map(ToString::to_string),
            Self::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resolve a control file's `URL:` value against where the control file
/// was loaded from. Absolute URLs are returned as-is.
///
/// # Errors
/// Returns an error if the reference cannot be joined onto `base`
pub fn resolve_url(base: &Location, reference: &str) -> Result<Location, TransportError> {
    if Url::parse(reference).is_ok() {
        return Location::parse(reference);
    }

    match base {
        Location::Url(base) => base
            .join(reference)
            .map(Location::Url)
            .map_err(|source| TransportError::InvalidUrl {
                url: reference.to_string(),
                source,
            }),
        Location::Path(base) => {
            let reference = Path::new(reference);
            if reference.is_absolute() {
                return Ok(Location::Path(reference.to_path_buf()));
            }
            let dir = base.parent().unwrap_or_else(|| Path::new(""));
            Ok(Location::Path(dir.join(reference)))
        }
    }
}

/// Build the fetcher for `location`, checking that the resource is
/// `expected_length` bytes long where the server reports it.
///
/// # Errors
/// Returns an error if the HTTP client cannot be built
pub fn open_fetcher(
    location: &Location,
    options: &HttpOptions,
    expected_length: u64,
) -> Result<Arc<dyn RemoteFetcher>, TransportError> {
    let fetcher: Arc<dyn RemoteFetcher> = match location {
        Location::Url(url) => Arc::new(
            HttpFetcher::new(url.clone(), options.clone())?.with_expected_length(expected_length),
        ),
        Location::Path(path) => {
            Arc::new(LocalFetcher::new(path.clone()).with_expected_length(expected_length))
        }
    };
    debug!("Fetching target ranges from {}", fetcher.describe());
    Ok(fetcher)
}

/// Read and parse a control file from a URL or path
///
/// # Errors
/// Returns an error if the control file cannot be retrieved or parsed
pub async fn load_control(
    location: &Location,
    options: &HttpOptions,
) -> Result<ControlFile, TransportError> {
    let data = match location {
        Location::Url(url) => HttpFetcher::new(url.clone(), options.clone())?
            .get()
            .await?
            .to_vec(),
        Location::Path(path) => {
            tokio::fs::read(path)
                .await
                .map_err(|source| TransportError::Read {
                    path: path.clone(),
                    source,
                })?
        }
    };
    debug!("Loaded {} byte control file from {location}", data.len());
    Ok(ControlFile::parse(&data)?)
}
