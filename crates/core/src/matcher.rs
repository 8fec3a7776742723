//! Find target blocks inside a local seed file
//!
//! A window of one block slides over the seed. The weak checksum rolls one
//! byte at a time; only when it hits the index is the strong checksum
//! computed. After a confirmed match the window jumps past the matched
//! bytes, so no seed byte is part of two matches.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::chunks::ChunkInfo;
use crate::error::{Result, SyncError};
use crate::hash::StrongSum;
use crate::index::{BlockDescriptor, ChecksumIndex};
use crate::rsum::Rsum;

/// Default number of matches buffered between scanner and writer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Minimum read size when refilling the window buffer
const READ_CHUNK: usize = 256 * 1024;

/// Summary of one seed scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchStats {
    /// Seed bytes the window passed over
    pub bytes_scanned: u64,
    pub matched_blocks: u64,
    pub matched_bytes: u64,
}

/// Matches streaming out of a running scan.
///
/// Drain the chunks, then call [`finish`](Self::finish): a scan that failed
/// part-way only reports its error there.
pub struct ChunkStream {
    rx: mpsc::Receiver<ChunkInfo>,
    handle: JoinHandle<Result<MatchStats>>,
}

impl ChunkStream {
    /// Next match, or `None` once the scan has stopped
    pub async fn recv(&mut self) -> Option<ChunkInfo> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv) for use off the async runtime
    pub fn blocking_recv(&mut self) -> Option<ChunkInfo> {
        self.rx.blocking_recv()
    }

    /// Split into the receiving end and the scan's completion handle
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<ChunkInfo>, JoinHandle<Result<MatchStats>>) {
        (self.rx, self.handle)
    }

    /// Stop receiving and wait for the scan's outcome
    ///
    /// # Errors
    /// Returns the scan's read error, or [`SyncError::Task`] if it panicked
    pub async fn finish(self) -> Result<MatchStats> {
        drop(self.rx);
        self.handle.await?
    }
}

/// Scans seed files against a [`ChecksumIndex`]
#[derive(Debug, Clone)]
pub struct ChunkMatcher {
    index: Arc<ChecksumIndex>,
    capacity: usize,
}

impl ChunkMatcher {
    #[must_use]
    pub fn new(index: Arc<ChecksumIndex>) -> Self {
        Self {
            index,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Bound on matches queued ahead of the consumer
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Scan `path` on a blocking worker, streaming matches as they are found.
    ///
    /// The worker blocks while the channel is full and stops quietly if the
    /// receiver is dropped. Must be called from within a tokio runtime.
    #[must_use]
    pub fn search(&self, path: &Path) -> ChunkStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let matcher = self.clone();
        let path = path.to_path_buf();

        let handle = tokio::task::spawn_blocking(move || {
            let read_err = |source| SyncError::LocalRead {
                path: path.clone(),
                source,
            };
            let file = File::open(&path).map_err(read_err)?;
            debug!("Scanning seed {}", path.display());

            let stats = matcher
                .scan(file, |chunk| tx.blocking_send(chunk).is_ok())
                .map_err(read_err)?;
            debug!(
                "Seed {}: {} blocks ({} bytes) reusable after scanning {} bytes",
                path.display(),
                stats.matched_blocks,
                stats.matched_bytes,
                stats.bytes_scanned
            );
            Ok(stats)
        });

        ChunkStream { rx, handle }
    }

    /// Scan `reader` synchronously, passing each match to `emit`.
    ///
    /// `emit` returns `false` to stop the scan early.
    ///
    /// # Errors
    /// Returns the first read error
    pub fn scan<R: Read>(
        &self,
        reader: R,
        mut emit: impl FnMut(ChunkInfo) -> bool,
    ) -> io::Result<MatchStats> {
        let index = &*self.index;
        let mut stats = MatchStats::default();
        if index.block_count() == 0 {
            return Ok(stats);
        }

        let block_size = usize::try_from(index.block_size())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "block size exceeds memory"))?;
        let block_count = usize::try_from(index.block_count())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "too many blocks"))?;

        let paired = index.seq_matches() > 1;
        let lookahead = if paired { 2 * block_size } else { block_size };
        let mut window = Window::new(reader, lookahead + 1);
        let mut claimed = vec![false; block_count];
        let mut rsum: Option<Rsum> = None;
        let mut next_rsum: Option<Rsum> = None;
        // Block expected at the window start right after a match
        let mut follows: Option<u64> = None;

        loop {
            window.fill()?;
            let available = window.available();
            if available == 0 {
                break;
            }
            let len = available.min(block_size);
            let current = window.slice(len);
            let sum = *rsum.get_or_insert_with(|| Rsum::of_block(current, block_size));
            let next = paired.then(|| {
                *next_rsum.get_or_insert_with(|| {
                    Rsum::of_block(window.range(block_size, lookahead), block_size)
                })
            });

            if let Some(desc) = self.find_match(sum, next, follows, current, block_size, &claimed)
            {
                claimed[desc.block_index as usize] = true;
                let chunk = ChunkInfo {
                    source_offset: window.offset(),
                    target_offset: desc.target_offset,
                    size: desc.size,
                };
                stats.matched_blocks += 1;
                stats.matched_bytes += desc.size;
                if !emit(chunk) {
                    break;
                }
                follows = Some(desc.block_index + 1);
                window.advance(desc.size as usize);
                rsum = None;
                next_rsum = None;
            } else {
                let out = current[0];
                let incoming = window.byte_at(block_size);
                if let Some(sum) = rsum.as_mut() {
                    sum.roll(out, incoming, block_size);
                }
                if let Some(sum) = next_rsum.as_mut() {
                    sum.roll(incoming, window.byte_at(lookahead), block_size);
                }
                follows = None;
                window.advance(1);
            }
        }

        stats.bytes_scanned = window.offset();
        Ok(stats)
    }

    /// Confirm a weak hit with the strong checksum.
    ///
    /// A full window may match any block no longer than itself; a short
    /// window at end of input only matches a block of exactly its length.
    /// With paired lookups, `next` must also equal the following block's
    /// weak sum, unless the candidate is the last block or directly
    /// continues the previous match (`follows`). Among equal candidates, a
    /// block not yet claimed by this scan wins.
    fn find_match(
        &self,
        sum: Rsum,
        next: Option<Rsum>,
        follows: Option<u64>,
        window: &[u8],
        block_size: usize,
        claimed: &[bool],
    ) -> Option<&BlockDescriptor> {
        let candidates = self.index.lookup(sum.value());
        let len = window.len() as u64;
        let full = window.len() == block_size;
        let last_block = self.index.block_count() - 1;
        let mut eligible = candidates
            .iter()
            .filter(|d| if full { d.size <= len } else { d.size == len })
            .filter(|d| match next {
                Some(next) if d.block_index < last_block && follows != Some(d.block_index) => {
                    self.index.weak_matches(d.block_index + 1, next.value())
                }
                _ => true,
            })
            .peekable();
        eligible.peek()?;

        let strong = StrongSum::of_block(window, block_size, self.index.strong_len());
        let mut first = None;
        for desc in eligible.filter(|d| d.strong == strong) {
            if !claimed[desc.block_index as usize] {
                return Some(desc);
            }
            first.get_or_insert(desc);
        }
        first
    }
}

/// Sliding view over a reader.
///
/// Keeps at least `want` bytes buffered ahead of the window start until
/// end of input; bytes past the end read as zero.
struct Window<R> {
    reader: R,
    buf: Vec<u8>,
    start: usize,
    offset: u64,
    want: usize,
    eof: bool,
}

impl<R: Read> Window<R> {
    fn new(reader: R, want: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            start: 0,
            offset: 0,
            want,
            eof: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.eof || self.available() >= self.want {
            return Ok(());
        }

        self.buf.drain(..self.start);
        self.start = 0;
        let chunk = READ_CHUNK.max(self.want);

        while !self.eof && self.buf.len() < self.want {
            let old = self.buf.len();
            self.buf.resize(old + chunk, 0);
            match self.reader.read(&mut self.buf[old..]) {
                Ok(0) => {
                    self.buf.truncate(old);
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(old + n),
                Err(e) if e.kind() == ErrorKind::Interrupted => self.buf.truncate(old),
                Err(e) => {
                    self.buf.truncate(old);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn available(&self) -> usize {
        self.buf.len() - self.start
    }

    fn slice(&self, len: usize) -> &[u8] {
        &self.buf[self.start..self.start + len]
    }

    /// Bytes `from..to` past the window start, cut short at end of input
    fn range(&self, from: usize, to: usize) -> &[u8] {
        let end = self.buf.len().min(self.start + to);
        let begin = end.min(self.start + from);
        &self.buf[begin..end]
    }

    fn byte_at(&self, i: usize) -> u8 {
        self.buf.get(self.start + i).copied().unwrap_or(0)
    }

    fn advance(&mut self, n: usize) {
        self.start += n;
        self.offset += n as u64;
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::chunks::complement;
    use crate::control::{ControlFile, GenerateOptions, HashLengths};

    const BLOCK: usize = 2048;

    fn target() -> Vec<u8> {
        // 2 full blocks and a 60-byte tail
        (0..4156u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect()
    }

    fn index_for(data: &[u8], block_size: usize) -> Arc<ChecksumIndex> {
        index_with(data, block_size, HashLengths::default())
    }

    fn index_with(data: &[u8], block_size: usize, hash_lengths: HashLengths) -> Arc<ChecksumIndex> {
        let options = GenerateOptions {
            block_size: block_size as u64,
            filename: None,
            mtime: None,
            url: None,
            hash_lengths,
        };
        let control = ControlFile::generate(data, options).unwrap();
        Arc::new(control.checksum_index().unwrap())
    }

    fn scan(index: Arc<ChecksumIndex>, seed: &[u8]) -> Vec<ChunkInfo> {
        let mut found = Vec::new();
        ChunkMatcher::new(index)
            .scan(Cursor::new(seed), |chunk| {
                found.push(chunk);
                true
            })
            .unwrap();
        found.sort_by_key(|c| c.target_offset);
        found
    }

    #[test]
    fn test_first_block_changed() {
        let target = target();
        let mut seed = target.clone();
        seed[100] ^= 0xff;
        seed[1500] ^= 0x55;

        let found = scan(index_for(&target, BLOCK), &seed);

        assert_eq!(
            found,
            vec![
                ChunkInfo {
                    source_offset: 2048,
                    target_offset: 2048,
                    size: 2048
                },
                ChunkInfo {
                    source_offset: 4096,
                    target_offset: 4096,
                    size: 60
                },
            ]
        );
    }

    #[test]
    fn test_identical_file_fully_matched() {
        let target = target();
        let found = scan(index_for(&target, BLOCK), &target);

        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|c| c.source_offset == c.target_offset));
        assert!(complement(target.len() as u64, &found).is_empty());
    }

    #[test]
    fn test_displaced_content() {
        let target = target();
        let mut seed = b"inserted prefix of 29 bytes..".to_vec();
        seed.extend_from_slice(&target);

        let found = scan(index_for(&target, BLOCK), &seed);

        assert_eq!(found.len(), 3);
        for chunk in &found {
            assert_eq!(chunk.source_offset, chunk.target_offset + 29);
        }
    }

    /// Lengths zsyncmake writes for multi-block files
    const PAIRED: HashLengths = HashLengths {
        seq_matches: 2,
        rsum_bytes: 2,
        checksum_bytes: 5,
    };

    #[test]
    fn test_paired_lookup_matches_whole_file() {
        let target = target();
        let index = index_with(&target, BLOCK, PAIRED);
        assert_eq!(index.seq_matches(), 2);

        let mut seed = b"inserted prefix of 29 bytes..".to_vec();
        seed.extend_from_slice(&target);
        let found = scan(index, &seed);

        let offsets: Vec<u64> = found.iter().map(|c| c.target_offset).collect();
        assert_eq!(offsets, vec![0, 2048, 4096]);
        for chunk in &found {
            assert_eq!(chunk.source_offset, chunk.target_offset + 29);
        }
    }

    #[test]
    fn test_paired_lookup_needs_following_block() {
        let target = target();
        let mut seed = target[..BLOCK].to_vec();
        seed.extend_from_slice(&[0x5a; 3000]);

        // Alone, the first block matches on its own sums
        let single = scan(index_for(&target, BLOCK), &seed);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].target_offset, 0);

        // Paired, the bytes after it must carry the second block's weak sum
        assert!(scan(index_with(&target, BLOCK, PAIRED), &seed).is_empty());
    }

    #[test]
    fn test_paired_lookup_after_changed_block() {
        let target = target();
        let mut seed = target.clone();
        seed[100] ^= 0xff;

        let found = scan(index_with(&target, BLOCK, PAIRED), &seed);
        let offsets: Vec<u64> = found.iter().map(|c| c.target_offset).collect();
        assert_eq!(offsets, vec![2048, 4096]);
    }

    #[test]
    fn test_middle_block_changed() {
        let target = target();
        let mut seed = target.clone();
        seed[3000] ^= 1;

        let found = scan(index_for(&target, BLOCK), &seed);
        let offsets: Vec<u64> = found.iter().map(|c| c.target_offset).collect();
        assert_eq!(offsets, vec![0, 4096]);
    }

    #[test]
    fn test_tail_block_changed() {
        let target = target();
        let mut seed = target.clone();
        seed[4100] ^= 1;

        let found = scan(index_for(&target, BLOCK), &seed);
        let offsets: Vec<u64> = found.iter().map(|c| c.target_offset).collect();
        assert_eq!(offsets, vec![0, 2048]);
    }

    #[test]
    fn test_short_tail_matched_at_other_offset() {
        let target = target();
        // Seed ends with the target's 60-byte tail, preceded by junk
        let mut seed = vec![0xaa; 333];
        seed.extend_from_slice(&target[4096..]);

        let found = scan(index_for(&target, BLOCK), &seed);
        assert_eq!(
            found,
            vec![ChunkInfo {
                source_offset: 333,
                target_offset: 4096,
                size: 60
            }]
        );
    }

    #[test]
    fn test_weak_collision_without_strong_match() {
        let data = b"abcdefgh";
        let weak = Rsum::of_block(data, 8).value();
        let wrong = StrongSum::of_block(b"12345678", 8, 16);
        let index = ChecksumIndex::new(8, 8, 4, 16, [(weak, wrong)]).unwrap();

        assert!(scan(Arc::new(index), data).is_empty());
    }

    #[test]
    fn test_collision_list_checks_every_candidate() {
        let data = b"abcdefgh";
        let weak = Rsum::of_block(data, 8).value();
        let wrong = StrongSum::of_block(b"12345678", 8, 16);
        let right = StrongSum::of_block(data, 8, 16);
        let index = ChecksumIndex::new(8, 16, 4, 16, [(weak, wrong), (weak, right)]).unwrap();

        let found = scan(Arc::new(index), data);
        assert_eq!(
            found,
            vec![ChunkInfo {
                source_offset: 0,
                target_offset: 8,
                size: 8
            }]
        );
    }

    #[test]
    fn test_repeated_blocks_all_claimed() {
        let mut target = vec![7u8; 64];
        target.extend_from_slice(&[9u8; 32]);
        target.extend_from_slice(&[7u8; 32]);

        let found = scan(index_for(&target, 32), &target);
        let offsets: Vec<u64> = found.iter().map(|c| c.target_offset).collect();
        assert_eq!(offsets, vec![0, 32, 64, 96]);
        assert!(complement(target.len() as u64, &found).is_empty());
    }

    #[test]
    fn test_matches_never_overlap_in_seed() {
        // Periodic content lets a block match at many offsets
        let target: Vec<u8> = b"xyz".iter().copied().cycle().take(200).collect();
        let mut found = scan(index_for(&target, 16), &target);
        found.sort_by_key(|c| c.source_offset);

        for pair in found.windows(2) {
            assert!(pair[0].source_offset + pair[0].size <= pair[1].source_offset);
        }
    }

    #[test]
    fn test_empty_seed() {
        let target = target();
        assert!(scan(index_for(&target, BLOCK), &[]).is_empty());
    }

    #[test]
    fn test_seed_shorter_than_block() {
        let target = target();
        assert!(scan(index_for(&target, BLOCK), &target[..100]).is_empty());
    }

    #[test]
    fn test_emit_false_stops_scan() {
        let target = target();
        let mut calls = 0;
        ChunkMatcher::new(index_for(&target, BLOCK))
            .scan(Cursor::new(&target), |_| {
                calls += 1;
                false
            })
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_read_error_surfaces() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("disk on fire"))
            }
        }

        let target = target();
        let result = ChunkMatcher::new(index_for(&target, BLOCK)).scan(Failing, |_| true);
        assert!(result.is_err());
    }

    #[test]
    fn test_stats() {
        let target = target();
        let stats = ChunkMatcher::new(index_for(&target, BLOCK))
            .scan(Cursor::new(&target), |_| true)
            .unwrap();
        assert_eq!(
            stats,
            MatchStats {
                bytes_scanned: 4156,
                matched_blocks: 3,
                matched_bytes: 4156
            }
        );
    }

    #[tokio::test]
    async fn test_search_streams_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("seed");
        let target = target();
        std::fs::write(&path, &target).unwrap();

        let mut stream = ChunkMatcher::new(index_for(&target, BLOCK))
            .with_capacity(1)
            .search(&path);
        let mut found = Vec::new();
        while let Some(chunk) = stream.recv().await {
            found.push(chunk);
        }
        let stats = stream.finish().await.unwrap();

        assert_eq!(found.len(), 3);
        assert_eq!(stats.matched_bytes, 4156);
    }

    #[tokio::test]
    async fn test_search_missing_file_reports_after_drain() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = target();

        let mut stream = ChunkMatcher::new(index_for(&target, BLOCK)).search(&dir.path().join("nope"));
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            stream.finish().await,
            Err(SyncError::LocalRead { .. })
        ));
    }
}
