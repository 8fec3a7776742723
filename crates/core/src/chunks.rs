//! Chunk placements and the gaps between them
//!
//! A [`ChunkInfo`] says "copy `size` bytes from the source at
//! `source_offset` into the output at `target_offset`". Whatever target
//! bytes no chunk covers are [`ByteRange`] gaps that must be fetched.

use serde::{Deserialize, Serialize};

/// One span to copy from a source into the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Offset in the source (seed file, or 0 for a fetched range)
    pub source_offset: u64,
    /// Offset in the reconstructed file
    pub target_offset: u64,
    /// Number of bytes
    pub size: u64,
}

impl ChunkInfo {
    /// Target range this chunk fills
    #[must_use]
    pub fn target_range(&self) -> ByteRange {
        ByteRange::new(self.target_offset, self.size)
    }
}

/// A contiguous range of the target file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// One past the last byte
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Inclusive last byte, as used in an HTTP `Range` header
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.end().saturating_sub(1)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Target ranges that no matched chunk covers.
///
/// Chunks may arrive in any order and may overlap; they are sorted and
/// merged before the complement is taken. Parts of chunks beyond
/// `total_length` are ignored.
#[must_use]
pub fn complement(total_length: u64, matched: &[ChunkInfo]) -> Vec<ByteRange> {
    let mut covered: Vec<ByteRange> = matched
        .iter()
        .map(ChunkInfo::target_range)
        .filter(|r| !r.is_empty() && r.start < total_length)
        .collect();
    covered.sort_unstable();

    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for range in covered {
        if range.start > cursor {
            gaps.push(ByteRange::new(cursor, range.start - cursor));
        }
        cursor = cursor.max(range.end());
    }
    if cursor < total_length {
        gaps.push(ByteRange::new(cursor, total_length - cursor));
    }

    gaps
}

/// Split gaps into requests of at most `max_len` bytes.
///
/// Requests stay in gap order and never span two gaps.
#[must_use]
pub fn split_requests(gaps: &[ByteRange], max_len: u64) -> Vec<ByteRange> {
    let max_len = max_len.max(1);
    let mut requests = Vec::with_capacity(gaps.len());

    for gap in gaps {
        let mut start = gap.start;
        while start < gap.end() {
            let length = max_len.min(gap.end() - start);
            requests.push(ByteRange::new(start, length));
            start += length;
        }
    }

    requests
}

/// Total bytes covered by `ranges`
#[must_use]
pub fn total_len(ranges: &[ByteRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}
