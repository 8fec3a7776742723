//! Strong block checksums (MD4) and whole-file digests (SHA-1)
//!
//! Both algorithms are fixed by the zsync control file format.

use std::fmt;
use std::io::Read;

use md4::{Digest as _, Md4};
use sha1::Sha1;

/// Maximum number of MD4 bytes a control file may store per block
pub const MAX_STRONG_LEN: usize = 16;

/// MD4 of a block, truncated to the length the control file stores
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrongSum {
    bytes: [u8; MAX_STRONG_LEN],
    len: u8,
}

impl StrongSum {
    /// Hash `block` zero-padded to `block_size`, keeping the first `len` bytes
    #[must_use]
    pub fn of_block(block: &[u8], block_size: usize, len: usize) -> Self {
        let mut hasher = Md4::new();
        hasher.update(block);
        if block.len() < block_size {
            hasher.update(vec![0u8; block_size - block.len()]);
        }
        let digest = hasher.finalize();

        let mut bytes = [0u8; MAX_STRONG_LEN];
        bytes.copy_from_slice(&digest);
        Self::truncated(bytes, len)
    }

    /// Wrap stored checksum bytes (at most 16)
    #[must_use]
    pub fn from_stored(stored: &[u8]) -> Self {
        let len = stored.len().min(MAX_STRONG_LEN);
        let mut bytes = [0u8; MAX_STRONG_LEN];
        bytes[..len].copy_from_slice(&stored[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    fn truncated(mut bytes: [u8; MAX_STRONG_LEN], len: usize) -> Self {
        let len = len.min(MAX_STRONG_LEN);
        bytes[len..].fill(0);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// Stored bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for StrongSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongSum({})", self.to_hex())
    }
}

/// SHA-1 of a complete file
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDigest([u8; 20]);

impl FileDigest {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&Sha1::digest(data));
        Self(bytes)
    }

    /// Hash everything a reader yields
    ///
    /// # Errors
    /// Returns an error if reading fails
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = FileHasher::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finish())
    }

    /// Parse the 40-character hex form used in control files
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s.trim(), &mut bytes).ok()?;
        Some(Self(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Incremental [`FileDigest`] computation
#[derive(Clone, Default)]
pub struct FileHasher(Sha1);

impl FileHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    #[must_use]
    pub fn finish(self) -> FileDigest {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&self.0.finalize());
        FileDigest(bytes)
    }
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileDigest({})", self.to_hex())
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
