//! Weak-checksum lookup table over the target's blocks

use std::collections::HashMap;

use crate::error::ControlError;
use crate::hash::StrongSum;
use crate::rsum;

/// Checksums and placement of one target block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub block_index: u64,
    pub target_offset: u64,
    /// Block size, except for a shorter final block
    pub size: u64,
    /// Weak checksum, already masked to the stored width
    pub weak: u32,
    pub strong: StrongSum,
}

/// Maps a weak checksum to every block that carries it, in block order.
///
/// Weak checksums collide, so a hit only nominates candidates; the strong
/// checksum decides.
#[derive(Debug, Clone)]
pub struct ChecksumIndex {
    block_size: u64,
    total_length: u64,
    weak_mask: u32,
    strong_len: usize,
    block_count: u64,
    /// Consecutive blocks whose weak sums must agree before a strong check
    seq_matches: usize,
    /// Masked weak checksum of each block, by block index
    weaks: Vec<u32>,
    map: HashMap<u32, Vec<BlockDescriptor>>,
}

impl ChecksumIndex {
    /// Build from per-block `(weak, strong)` pairs in block order.
    ///
    /// # Errors
    /// Returns an error if the block count does not tile `total_length`.
    pub fn new(
        block_size: u64,
        total_length: u64,
        rsum_bytes: usize,
        strong_len: usize,
        blocks: impl IntoIterator<Item = (u32, StrongSum)>,
    ) -> Result<Self, ControlError> {
        if block_size == 0 {
            return Err(ControlError::InvalidIndex("block size is zero".into()));
        }

        let weak_mask = rsum::mask(rsum_bytes);
        let expected_blocks = total_length.div_ceil(block_size);
        let mut map: HashMap<u32, Vec<BlockDescriptor>> = HashMap::new();
        let mut block_count = 0u64;
        let mut weaks = Vec::new();

        for (block_index, (weak, strong)) in (0u64..).zip(blocks) {
            if block_index >= expected_blocks {
                return Err(ControlError::InvalidIndex(format!(
                    "more than {expected_blocks} blocks for {total_length} bytes"
                )));
            }
            let target_offset = block_index * block_size;
            let size = block_size.min(total_length - target_offset);
            let weak = weak & weak_mask;
            weaks.push(weak);

            map.entry(weak).or_default().push(BlockDescriptor {
                block_index,
                target_offset,
                size,
                weak,
                strong,
            });
            block_count += 1;
        }

        if block_count != expected_blocks {
            return Err(ControlError::InvalidIndex(format!(
                "{block_count} blocks do not cover {total_length} bytes"
            )));
        }

        Ok(Self {
            block_size,
            total_length,
            weak_mask,
            strong_len,
            block_count,
            seq_matches: 1,
            weaks,
            map,
        })
    }

    /// Require the weak sums of `seq_matches` consecutive blocks to agree
    /// before a candidate is checked with the strong sum
    #[must_use]
    pub fn with_seq_matches(mut self, seq_matches: usize) -> Self {
        self.seq_matches = seq_matches.clamp(1, 2);
        self
    }

    #[must_use]
    pub fn seq_matches(&self) -> usize {
        self.seq_matches
    }

    /// Whether `weak` (masked here) is the stored weak sum of `block_index`
    #[must_use]
    pub fn weak_matches(&self, block_index: u64, weak: u32) -> bool {
        usize::try_from(block_index)
            .ok()
            .and_then(|i| self.weaks.get(i))
            .is_some_and(|&stored| stored == weak & self.weak_mask)
    }

    /// Candidates whose stored weak checksum equals `weak` (masked here)
    #[must_use]
    pub fn lookup(&self, weak: u32) -> &[BlockDescriptor] {
        self.map
            .get(&(weak & self.weak_mask))
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Number of strong checksum bytes stored per block
    #[must_use]
    pub fn strong_len(&self) -> usize {
        self.strong_len
    }

    /// All descriptors sorted by block index
    #[must_use]
    pub fn descriptors(&self) -> Vec<&BlockDescriptor> {
        let mut all: Vec<_> = self.map.values().flatten().collect();
        all.sort_by_key(|d| d.block_index);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsum::Rsum;

    fn index_for(data: &[u8], block_size: usize, rsum_bytes: usize) -> ChecksumIndex {
        let blocks = data.chunks(block_size).map(|block| {
            (
                Rsum::of_block(block, block_size).value(),
                StrongSum::of_block(block, block_size, 16),
            )
        });
        ChecksumIndex::new(block_size as u64, data.len() as u64, rsum_bytes, 16, blocks).unwrap()
    }

    #[test]
    fn test_descriptors_tile_target() {
        let data = b"0123456789abcdefghij".repeat(3);
        let index = index_for(&data, 16, 4);

        assert_eq!(index.block_count(), 4);
        let mut cursor = 0;
        for (i, desc) in index.descriptors().iter().enumerate() {
            assert_eq!(desc.block_index, i as u64);
            assert_eq!(desc.target_offset, cursor);
            cursor += desc.size;
        }
        assert_eq!(cursor, 60);
        assert_eq!(index.descriptors().last().unwrap().size, 12);
    }

    #[test]
    fn test_collisions_kept_in_block_order() {
        // Identical blocks share a weak checksum
        let data = b"AAAABBBBAAAA";
        let index = index_for(data, 4, 4);
        let weak = Rsum::of_block(b"AAAA", 4).value();

        let hits = index.lookup(weak);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].block_index, 0);
        assert_eq!(hits[1].block_index, 2);
    }

    #[test]
    fn test_lookup_masks_probe() {
        let data = b"abcdefgh";
        let index = index_for(data, 8, 2);
        let full = Rsum::of_block(data, 8).value();

        assert_eq!(index.lookup(full).len(), 1);
        assert_eq!(index.lookup(full & 0xffff).len(), 1);
        assert!(index.lookup(full ^ 1).is_empty());
    }

    #[test]
    fn test_rejects_wrong_block_count() {
        let strong = StrongSum::from_stored(&[0; 16]);
        let result = ChecksumIndex::new(4, 10, 4, 16, vec![(0, strong); 2]);
        assert!(matches!(result, Err(ControlError::InvalidIndex(_))));

        let result = ChecksumIndex::new(4, 10, 4, 16, vec![(0, strong); 4]);
        assert!(matches!(result, Err(ControlError::InvalidIndex(_))));
    }

    #[test]
    fn test_weak_matches_by_block() {
        let data = b"AAAABBBB";
        let index = index_for(data, 4, 2).with_seq_matches(2);
        let b = Rsum::of_block(b"BBBB", 4).value();

        assert_eq!(index.seq_matches(), 2);
        assert!(index.weak_matches(1, b));
        assert!(!index.weak_matches(0, b));
        assert!(!index.weak_matches(2, b));
    }

    #[test]
    fn test_empty_target() {
        let index = ChecksumIndex::new(1024, 0, 4, 16, Vec::new()).unwrap();
        assert_eq!(index.block_count(), 0);
        assert!(index.lookup(0).is_empty());
    }
}
