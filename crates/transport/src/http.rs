//! HTTP range fetcher
//!
//! Each gap becomes one `Range: bytes=a-b` request. The server must answer
//! `206 Partial Content` for exactly that range; a `200` means the server
//! ignores ranges and would send the whole file for every gap.
//!
//! The body is read completely inside each attempt, so a connection that
//! drops mid-body is retried like one that fails before the headers.

use std::future::Future;
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt as _;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use zsync2_core::config::HttpConfig;
use zsync2_core::{ByteRange, FetchError, RangeReader, RemoteFetcher, read_body};

/// Client settings for [`HttpFetcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    /// Extra attempts after a transient failure
    pub retries: u32,
    /// Delay before the first retry; the nth retry waits n times this
    pub retry_backoff: Duration,
    /// Connect timeout, and the longest a response may stall between reads
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for HttpOptions {
    fn from(config: &HttpConfig) -> Self {
        Self {
            retries: config.retries,
            retry_backoff: config.retry_backoff(),
            timeout: config.timeout(),
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Fetches ranges of one URL over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: Url,
    options: HttpOptions,
    expected_length: Option<u64>,
}

impl HttpFetcher {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn new(url: Url, options: HttpOptions) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.timeout)
            .read_timeout(options.timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                source: Box::new(e),
            })?;
        Ok(Self {
            client,
            url,
            options,
            expected_length: None,
        })
    }

    /// Reject responses whose `Content-Range` reports a different total size
    #[must_use]
    pub fn with_expected_length(mut self, length: u64) -> Self {
        self.expected_length = Some(length);
        self
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// GET the whole resource
    ///
    /// # Errors
    /// Returns an error for transport failures or a non-success status
    pub async fn get(&self) -> Result<Bytes, FetchError> {
        self.with_retries("GET", || async {
            let response = self
                .client
                .get(self.url.clone())
                .send()
                .await
                .map_err(|e| self.transport_err(e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: self.url.to_string(),
                    status: status.as_u16(),
                });
            }
            response.bytes().await.map_err(|e| self.transport_err(e))
        })
        .await
    }

    async fn fetch_once(&self, range: ByteRange) -> Result<Bytes, FetchError> {
        let last = range.last();
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={}-{last}", range.start))
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                return Err(FetchError::RangeNotSupported {
                    url: self.url.to_string(),
                });
            }
            status => {
                return Err(FetchError::Status {
                    url: self.url.to_string(),
                    status: status.as_u16(),
                });
            }
        }

        let got = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !self.range_matches(&got, range) {
            return Err(FetchError::RangeMismatch {
                url: self.url.to_string(),
                start: range.start,
                end: last,
                got,
            });
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        read_body(StreamReader::new(stream), range, self.url.as_str()).await
    }

    fn range_matches(&self, content_range: &str, range: ByteRange) -> bool {
        let Some((start, end, total)) = parse_content_range(content_range) else {
            return false;
        };
        let total_ok = match (self.expected_length, total) {
            (Some(expected), Some(total)) => expected == total,
            _ => true,
        };
        start == range.start && end == range.last() && total_ok
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.options.retries => {
                    attempt += 1;
                    let delay = self.options.retry_backoff * attempt;
                    warn!(
                        "{what} {} failed: {e}; retry {attempt}/{} in {delay:?}",
                        self.url, self.options.retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn transport_err(&self, err: reqwest::Error) -> FetchError {
        FetchError::Transport {
            url: self.url.to_string(),
            source: Box::new(err),
        }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, range: ByteRange) -> Result<RangeReader, FetchError> {
        if range.is_empty() {
            return Ok(Box::pin(tokio::io::empty()));
        }
        debug!("GET {} bytes={}-{}", self.url, range.start, range.last());
        let body = self
            .with_retries("range request", || self.fetch_once(range))
            .await?;
        Ok(Box::pin(Cursor::new(body)))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Parse `bytes start-end/total`, where total may be `*`
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}
