//! Rolling weak checksum for block matching
//!
//! This is the zsync `rsum`: two 16-bit sums where `a` is the byte sum and
//! `b` weights each byte by its distance from the end of the window. Both
//! update in O(1) when the window slides by one byte.

/// Rolling checksum over a window of `block_size` bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rsum {
    a: u16,
    b: u16,
}

impl Rsum {
    /// Checksum of `block` zero-padded to `block_size` bytes.
    ///
    /// Padding zeros add nothing to either sum, but `block.len()` bytes are
    /// weighted as if the window were `block_size` long.
    #[must_use]
    pub fn of_block(block: &[u8], block_size: usize) -> Self {
        debug_assert!(block.len() <= block_size);
        let mut a: u16 = 0;
        let mut b: u16 = 0;
        let mut weight = block_size as u16;
        for &byte in block {
            a = a.wrapping_add(u16::from(byte));
            b = b.wrapping_add(weight.wrapping_mul(u16::from(byte)));
            weight = weight.wrapping_sub(1);
        }
        Self { a, b }
    }

    /// Reconstruct from the packed `(a << 16) | b` form
    #[must_use]
    pub const fn from_value(value: u32) -> Self {
        Self {
            a: (value >> 16) as u16,
            b: value as u16,
        }
    }

    /// Slide the window one byte: drop `out` from the front, append `incoming`.
    pub fn roll(&mut self, out: u8, incoming: u8, block_size: usize) {
        self.a = self
            .a
            .wrapping_add(u16::from(incoming))
            .wrapping_sub(u16::from(out));
        self.b = self
            .b
            .wrapping_add(self.a)
            .wrapping_sub((block_size as u16).wrapping_mul(u16::from(out)));
    }

    /// Packed big-endian value, `a` in the high half
    #[must_use]
    pub const fn value(&self) -> u32 {
        ((self.a as u32) << 16) | self.b as u32
    }

    /// The trailing `rsum_bytes` bytes of the big-endian packing, as stored
    /// in a control file
    #[must_use]
    pub fn to_stored(&self, rsum_bytes: usize) -> Vec<u8> {
        self.value().to_be_bytes()[4 - rsum_bytes..].to_vec()
    }
}

/// Mask selecting the part of [`Rsum::value`] kept by `rsum_bytes` stored bytes
#[must_use]
pub const fn mask(rsum_bytes: usize) -> u32 {
    match rsum_bytes {
        0 => 0,
        1..=3 => (1u32 << (8 * rsum_bytes)) - 1,
        _ => u32::MAX,
    }
}

/// Parse a stored weak checksum back into its masked packed value
#[must_use]
pub fn from_stored(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &byte| (acc << 8) | u32::from(byte))
}
