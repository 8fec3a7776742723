//! Reconstruct a target file from local seeds plus remote ranges
//!
//! Pass 1 scans each seed and copies its matching blocks into the output
//! while the scan is still running. Pass 2 fetches whatever no seed
//! covered. The result is then checked against the control file.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use futures_util::{TryStreamExt as _, stream};
use tracing::{debug, info, warn};

use crate::chunks::{ByteRange, ChunkInfo, complement, split_requests, total_len};
use crate::control::ControlFile;
use crate::error::{Result, SyncError};
use crate::fetch::{RemoteFetcher, read_range};
use crate::hash::FileDigest;
use crate::matcher::{ChunkMatcher, DEFAULT_CHANNEL_CAPACITY};
use crate::output::OutputFile;
use crate::writer::write_chunks;

/// Tuning for a sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Matches queued between a seed scan and its writer
    pub channel_capacity: usize,
    /// Remote requests in flight at once
    pub fetch_concurrency: usize,
    /// Longest single remote request
    pub max_request_bytes: u64,
    /// Check the result's SHA-1 when the control file carries one
    pub verify: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            fetch_concurrency: 4,
            max_request_bytes: 8 * 1024 * 1024,
            verify: true,
        }
    }
}

/// Outcome of a successful sync
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncReport {
    pub total_length: u64,
    /// Bytes copied from seeds
    pub reused_bytes: u64,
    /// Bytes downloaded
    pub fetched_bytes: u64,
    /// Uncovered target ranges after all seeds
    pub gaps: usize,
    /// Range requests issued for those gaps
    pub requests: usize,
    /// Seeds that existed and were scanned
    pub seeds_scanned: usize,
}

/// Drives one reconstruction of the file a control file describes
pub struct Syncer {
    control: Arc<ControlFile>,
    fetcher: Arc<dyn RemoteFetcher>,
    options: SyncOptions,
}

impl Syncer {
    #[must_use]
    pub fn new(
        control: Arc<ControlFile>,
        fetcher: Arc<dyn RemoteFetcher>,
        options: SyncOptions,
    ) -> Self {
        Self {
            control,
            fetcher,
            options,
        }
    }

    #[must_use]
    pub fn control(&self) -> &ControlFile {
        &self.control
    }

    /// Reconstruct the target into `output`.
    ///
    /// Seeds are scanned in order; a seed that does not exist is skipped.
    /// On failure `output` holds a partial result and must be discarded.
    ///
    /// # Errors
    /// Any failure of scanning, fetching, writing or verification aborts
    /// the sync.
    pub async fn sync_into(&self, seeds: &[PathBuf], output: &Arc<OutputFile>) -> Result<SyncReport> {
        let total_length = self.control.length;
        let block_size = self.control.block_size;
        output
            .set_len(total_length)
            .map_err(|source| SyncError::Write {
                offset: 0,
                len: total_length,
                source,
            })?;

        let index = Arc::new(self.control.checksum_index()?);
        let matcher = ChunkMatcher::new(index).with_capacity(self.options.channel_capacity);
        let mut covered = vec![false; self.control.blocks.len()];
        let mut matched: Vec<ChunkInfo> = Vec::new();
        let mut report = SyncReport {
            total_length,
            ..SyncReport::default()
        };

        for seed in seeds {
            if total_len_of(&matched) == total_length {
                debug!("Target fully covered, skipping remaining seeds");
                break;
            }
            match tokio::fs::metadata(seed).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => {
                    warn!("Seed {} is not a regular file, skipping", seed.display());
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    info!("Seed {} does not exist, skipping", seed.display());
                    continue;
                }
                Err(source) => {
                    return Err(SyncError::LocalRead {
                        path: seed.clone(),
                        source,
                    });
                }
            }

            let fresh = scan_seed(&matcher, seed, output, covered.clone(), block_size).await?;
            for chunk in &fresh {
                covered[block_of(chunk, block_size)] = true;
            }
            debug!(
                "Seed {} contributed {} new blocks",
                seed.display(),
                fresh.len()
            );
            matched.extend(fresh);
            report.seeds_scanned += 1;
        }

        let gaps = complement(total_length, &matched);
        let requests = split_requests(&gaps, self.options.max_request_bytes);
        report.reused_bytes = total_len_of(&matched);
        report.fetched_bytes = total_len(&gaps);
        report.gaps = gaps.len();
        report.requests = requests.len();
        info!(
            "Reusing {} of {} bytes, fetching {} bytes in {} requests from {}",
            report.reused_bytes,
            total_length,
            report.fetched_bytes,
            report.requests,
            self.fetcher.describe()
        );

        stream::iter(requests.into_iter().map(Ok::<_, SyncError>))
            .try_for_each_concurrent(self.options.fetch_concurrency, |range| {
                self.fetch_range(range, Arc::clone(output))
            })
            .await?;

        self.verify(output).await?;
        Ok(report)
    }

    /// Reconstruct the target at `destination`.
    ///
    /// Work happens in a temporary file beside `destination`, which is
    /// renamed over it only after the result has been verified. On failure
    /// `destination` is left as it was. `destination` may be one of the
    /// seeds.
    ///
    /// # Errors
    /// As [`sync_into`](Self::sync_into), plus [`SyncError::Output`] if the
    /// temporary file cannot be created or moved into place.
    pub async fn sync_to_path(&self, seeds: &[PathBuf], destination: &Path) -> Result<SyncReport> {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let output_err = |source| SyncError::Output {
            path: destination.to_path_buf(),
            source,
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix(".zsync2-").suffix(".part");
        // A new destination gets the usual mode for created files, umask applied
        #[cfg(unix)]
        builder.permissions(std::os::unix::fs::PermissionsExt::from_mode(0o666));
        let temp = builder.tempfile_in(dir).map_err(output_err)?;
        let (file, temp_path) = temp.into_parts();
        debug!("Writing into {}", temp_path.display());

        let output = Arc::new(OutputFile::from_file(file));
        // temp_path removes the file if we bail out here
        let report = self.sync_into(seeds, &output).await?;

        let mtime = self.control.mtime;
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let output_err = |source| SyncError::Output {
                path: destination.clone(),
                source,
            };
            output.sync_all().map_err(output_err)?;
            drop(output);

            if let Some(mtime) = mtime {
                let mtime = FileTime::from_unix_time(mtime.unix_timestamp(), mtime.nanosecond());
                filetime::set_file_mtime(&temp_path, mtime).map_err(output_err)?;
            }
            if let Ok(meta) = std::fs::metadata(&destination) {
                std::fs::set_permissions(&temp_path, meta.permissions()).map_err(output_err)?;
            }
            temp_path
                .persist(&destination)
                .map_err(|e| output_err(e.error))?;
            info!("Wrote {}", destination.display());
            Ok::<_, SyncError>(())
        })
        .await??;

        Ok(report)
    }

    async fn fetch_range(&self, range: ByteRange, output: Arc<OutputFile>) -> Result<()> {
        debug!(
            "Fetching bytes {}-{} from {}",
            range.start,
            range.last(),
            self.fetcher.describe()
        );
        let data = read_range(&*self.fetcher, range).await?;

        tokio::task::spawn_blocking(move || {
            let chunk = ChunkInfo {
                source_offset: 0,
                target_offset: range.start,
                size: range.length,
            };
            write_chunks(&mut Cursor::new(data), &*output, [chunk])
        })
        .await??;
        Ok(())
    }

    async fn verify(&self, output: &Arc<OutputFile>) -> Result<()> {
        let expected_len = self.control.length;
        let actual_len = output.len().map_err(SyncError::ReadBack)?;
        if actual_len != expected_len {
            return Err(SyncError::LengthMismatch {
                expected: expected_len,
                actual: actual_len,
            });
        }

        let Some(expected) = self.control.sha1 else {
            debug!("Control file carries no SHA-1, skipping verification");
            return Ok(());
        };
        if !self.options.verify {
            debug!("Verification disabled");
            return Ok(());
        }

        let mut file = output.file().try_clone().map_err(SyncError::ReadBack)?;
        let actual = tokio::task::spawn_blocking(move || {
            file.seek(SeekFrom::Start(0))?;
            FileDigest::from_reader(BufReader::new(file))
        })
        .await?
        .map_err(SyncError::ReadBack)?;

        if actual != expected {
            warn!("SHA-1 mismatch: expected {expected}, got {actual}");
            return Err(SyncError::Integrity {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        info!("SHA-1 verified: {actual}");
        Ok(())
    }
}

/// Scan one seed and copy its not-yet-covered matches into `output`,
/// returning the chunks written.
///
/// The scan and the copy run on separate blocking workers joined by the
/// matcher's bounded channel.
async fn scan_seed(
    matcher: &ChunkMatcher,
    seed: &Path,
    output: &Arc<OutputFile>,
    mut covered: Vec<bool>,
    block_size: u64,
) -> Result<Vec<ChunkInfo>> {
    let (mut rx, scan) = matcher.search(seed).into_parts();
    let path = seed.to_path_buf();
    let output = Arc::clone(output);

    let writer = tokio::task::spawn_blocking(move || {
        let mut source = File::open(&path).map_err(|source| SyncError::LocalRead {
            path: path.clone(),
            source,
        })?;

        let mut fresh = Vec::new();
        let chunks = std::iter::from_fn(|| rx.blocking_recv())
            .filter(|chunk| {
                let block = block_of(chunk, block_size);
                !std::mem::replace(&mut covered[block], true)
            })
            .inspect(|chunk| fresh.push(*chunk));
        write_chunks(&mut source, &*output, chunks)?;
        Ok::<_, SyncError>(fresh)
    });

    let written = writer.await?;
    let scanned = scan.await?;
    let fresh = written?;
    let stats = scanned?;
    debug!(
        "Scanned {} bytes of {}: {} matching blocks",
        stats.bytes_scanned,
        seed.display(),
        stats.matched_blocks
    );
    Ok(fresh)
}

fn block_of(chunk: &ChunkInfo, block_size: u64) -> usize {
    (chunk.target_offset / block_size) as usize
}

fn total_len_of(chunks: &[ChunkInfo]) -> u64 {
    chunks.iter().map(|c| c.size).sum()
}
