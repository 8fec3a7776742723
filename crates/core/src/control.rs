//! zsync control file format
//!
//! ```text
//! zsync: 0.6.2
//! Filename: app.AppImage
//! MTime: Tue, 14 Jun 2016 18:14:34 +0000
//! Blocksize: 2048
//! Length: 4156
//! Hash-Lengths: 1,4,16
//! URL: app.AppImage
//! SHA-1: 5a1c...
//!
//! <block table>
//! ```
//!
//! The block table holds, for each block in order, the trailing
//! `rsum_bytes` bytes of its big-endian weak checksum followed by the first
//! `checksum_bytes` bytes of its MD4. The final block is checksummed
//! zero-padded to the full block size.

use std::io::{Read, Write};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

use crate::error::ControlError;
use crate::hash::{FileDigest, FileHasher, MAX_STRONG_LEN, StrongSum};
use crate::index::ChecksumIndex;
use crate::rsum::{self, Rsum};

/// Format version written by [`ControlFile::write_to`]
pub const FORMAT_VERSION: &str = "0.6.2";

/// Files at least this large get the larger default block size
const LARGE_FILE: u64 = 100 * 1024 * 1024;

/// Block size zsyncmake would pick for a file of `length` bytes
#[must_use]
pub fn default_block_size(length: u64) -> u64 {
    if length < LARGE_FILE { 2048 } else { 4096 }
}

/// `Hash-Lengths` header: `seq_matches,rsum_bytes,checksum_bytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLengths {
    pub seq_matches: u8,
    pub rsum_bytes: u8,
    pub checksum_bytes: u8,
}

impl Default for HashLengths {
    fn default() -> Self {
        Self {
            seq_matches: 1,
            rsum_bytes: 4,
            checksum_bytes: MAX_STRONG_LEN as u8,
        }
    }
}

impl HashLengths {
    fn parse(value: &str) -> Result<Self, ControlError> {
        let invalid = || ControlError::InvalidHeader {
            name: "Hash-Lengths".into(),
            value: value.into(),
        };
        let parts: Vec<u8> = value
            .split(',')
            .map(|p| p.trim().parse().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let [seq_matches, rsum_bytes, checksum_bytes] = parts[..] else {
            return Err(invalid());
        };

        let lengths = Self {
            seq_matches,
            rsum_bytes,
            checksum_bytes,
        };
        if !lengths.is_valid() {
            return Err(invalid());
        }
        Ok(lengths)
    }

    fn is_valid(self) -> bool {
        (1..=2).contains(&self.seq_matches)
            && (1..=4).contains(&self.rsum_bytes)
            && (3..=MAX_STRONG_LEN as u8).contains(&self.checksum_bytes)
    }

    fn entry_len(self) -> usize {
        usize::from(self.rsum_bytes) + usize::from(self.checksum_bytes)
    }
}

/// Stored checksums of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChecksum {
    /// Weak checksum masked to `rsum_bytes`
    pub weak: u32,
    pub strong: StrongSum,
}

/// A parsed control file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    pub version: String,
    pub filename: Option<String>,
    pub mtime: Option<OffsetDateTime>,
    pub block_size: u64,
    pub length: u64,
    pub hash_lengths: HashLengths,
    /// Download locations, possibly relative to the control file
    pub urls: Vec<String>,
    pub sha1: Option<FileDigest>,
    /// Headers this implementation does not interpret, in file order
    pub extra_headers: Vec<(String, String)>,
    pub blocks: Vec<BlockChecksum>,
}

/// Inputs for [`ControlFile::generate`]
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub block_size: u64,
    pub filename: Option<String>,
    pub mtime: Option<OffsetDateTime>,
    pub url: Option<String>,
    pub hash_lengths: HashLengths,
}

impl ControlFile {
    /// Parse a complete control file
    ///
    /// # Errors
    /// Returns an error on malformed headers or a block table of the wrong size
    pub fn parse(data: &[u8]) -> Result<Self, ControlError> {
        let mut version = None;
        let mut filename = None;
        let mut mtime = None;
        let mut block_size = None;
        let mut length = None;
        let mut hash_lengths = HashLengths::default();
        let mut urls = Vec::new();
        let mut z_urls = 0usize;
        let mut sha1 = None;
        let mut extra_headers = Vec::new();

        let mut pos = 0;
        loop {
            let line_end = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| pos + i)
                .ok_or_else(|| ControlError::MalformedLine("unterminated header".into()))?;
            let line = String::from_utf8_lossy(&data[pos..line_end]);
            let line = line.trim_end_matches('\r');
            pos = line_end + 1;

            if line.is_empty() {
                break;
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ControlError::MalformedLine(line.to_string()))?;
            let value = value.trim();
            let invalid = || ControlError::InvalidHeader {
                name: name.to_string(),
                value: value.to_string(),
            };

            match name {
                "zsync" => version = Some(value.to_string()),
                "Min-Version" => {
                    if version_newer(value, FORMAT_VERSION) {
                        return Err(ControlError::Unsupported(format!(
                            "requires zsync {value} or newer"
                        )));
                    }
                }
                "Filename" => filename = Some(value.to_string()),
                "MTime" => {
                    mtime = Some(OffsetDateTime::parse(value, &Rfc2822).map_err(|_| invalid())?);
                }
                "Blocksize" => {
                    let size: u64 = value.parse().map_err(|_| invalid())?;
                    if size == 0 || !size.is_power_of_two() {
                        return Err(invalid());
                    }
                    block_size = Some(size);
                }
                "Length" => length = Some(value.parse().map_err(|_| invalid())?),
                "Hash-Lengths" => hash_lengths = HashLengths::parse(value)?,
                "URL" => urls.push(value.to_string()),
                "Z-URL" => z_urls += 1,
                "Z-Map2" => {
                    // Binary map of the compressed stream follows the line
                    let entries: usize = value.parse().map_err(|_| invalid())?;
                    pos = entries
                        .checked_mul(4)
                        .and_then(|len| pos.checked_add(len))
                        .filter(|&end| end <= data.len())
                        .ok_or_else(invalid)?;
                }
                "SHA-1" => sha1 = Some(FileDigest::from_hex(value).ok_or_else(invalid)?),
                _ => extra_headers.push((name.to_string(), value.to_string())),
            }
        }

        let version = version.ok_or(ControlError::MissingHeader("zsync"))?;
        let block_size: u64 = block_size.ok_or(ControlError::MissingHeader("Blocksize"))?;
        let length: u64 = length.ok_or(ControlError::MissingHeader("Length"))?;
        if urls.is_empty() && z_urls > 0 {
            return Err(ControlError::Unsupported(
                "compressed transfer (Z-URL) without a plain URL".into(),
            ));
        }

        let block_count = usize::try_from(length.div_ceil(block_size)).map_err(|_| {
            ControlError::InvalidIndex(format!("too many blocks for {length} bytes"))
        })?;
        let entry_len = hash_lengths.entry_len();
        let table = &data[pos..];
        let expected = block_count.checked_mul(entry_len).ok_or_else(|| {
            ControlError::InvalidIndex(format!("checksum table too large for {length} bytes"))
        })?;
        if table.len() < expected {
            return Err(ControlError::Truncated {
                expected,
                found: table.len(),
            });
        }
        if table.len() > expected {
            return Err(ControlError::TrailingData(table.len() - expected));
        }

        let rsum_bytes = usize::from(hash_lengths.rsum_bytes);
        let blocks = table
            .chunks_exact(entry_len)
            .map(|entry| BlockChecksum {
                weak: rsum::from_stored(&entry[..rsum_bytes]),
                strong: StrongSum::from_stored(&entry[rsum_bytes..]),
            })
            .collect();

        Ok(Self {
            version,
            filename,
            mtime,
            block_size,
            length,
            hash_lengths,
            urls,
            sha1,
            extra_headers,
            blocks,
        })
    }

    /// Read and parse a control file from a reader
    ///
    /// # Errors
    /// Returns an error if reading or parsing fails
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, ControlError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::parse(&data)
    }

    /// Checksum a target file and describe it as a control file
    ///
    /// # Errors
    /// Returns an error if reading fails or the options are invalid
    pub fn generate<R: Read>(mut reader: R, options: GenerateOptions) -> Result<Self, ControlError> {
        let block_size = options.block_size;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(ControlError::InvalidHeader {
                name: "Blocksize".into(),
                value: block_size.to_string(),
            });
        }
        let hash_lengths = options.hash_lengths;
        if !hash_lengths.is_valid() {
            return Err(ControlError::InvalidHeader {
                name: "Hash-Lengths".into(),
                value: format!(
                    "{},{},{}",
                    hash_lengths.seq_matches, hash_lengths.rsum_bytes, hash_lengths.checksum_bytes
                ),
            });
        }

        let block_len = usize::try_from(block_size)
            .map_err(|_| ControlError::InvalidIndex(format!("block size {block_size} too large")))?;
        let weak_mask = rsum::mask(usize::from(hash_lengths.rsum_bytes));
        let strong_len = usize::from(hash_lengths.checksum_bytes);

        let mut sha1 = FileHasher::new();
        let mut buffer = vec![0u8; block_len];
        let mut blocks = Vec::new();
        let mut length = 0u64;

        loop {
            let filled = read_full(&mut reader, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let block = &buffer[..filled];
            sha1.update(block);
            blocks.push(BlockChecksum {
                weak: Rsum::of_block(block, block_len).value() & weak_mask,
                strong: StrongSum::of_block(block, block_len, strong_len),
            });
            length += filled as u64;
            if filled < block_len {
                break;
            }
        }

        Ok(Self {
            version: FORMAT_VERSION.to_string(),
            filename: options.filename,
            mtime: options.mtime,
            block_size,
            length,
            hash_lengths,
            urls: options.url.into_iter().collect(),
            sha1: Some(sha1.finish()),
            extra_headers: Vec::new(),
            blocks,
        })
    }

    /// Serialise in the zsync control format
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), ControlError> {
        writeln!(w, "zsync: {}", self.version)?;
        if let Some(filename) = &self.filename {
            writeln!(w, "Filename: {filename}")?;
        }
        if let Some(mtime) = self.mtime {
            let formatted = mtime.format(&Rfc2822).map_err(|e| ControlError::InvalidHeader {
                name: "MTime".into(),
                value: e.to_string(),
            })?;
            writeln!(w, "MTime: {formatted}")?;
        }
        writeln!(w, "Blocksize: {}", self.block_size)?;
        writeln!(w, "Length: {}", self.length)?;
        let lengths = self.hash_lengths;
        writeln!(
            w,
            "Hash-Lengths: {},{},{}",
            lengths.seq_matches, lengths.rsum_bytes, lengths.checksum_bytes
        )?;
        for url in &self.urls {
            writeln!(w, "URL: {url}")?;
        }
        if let Some(sha1) = &self.sha1 {
            writeln!(w, "SHA-1: {sha1}")?;
        }
        for (name, value) in &self.extra_headers {
            writeln!(w, "{name}: {value}")?;
        }
        writeln!(w)?;

        let rsum_bytes = usize::from(lengths.rsum_bytes);
        for block in &self.blocks {
            w.write_all(&Rsum::from_value(block.weak).to_stored(rsum_bytes))?;
            w.write_all(block.strong.as_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Serialise into a byte vector
    ///
    /// # Errors
    /// Returns an error if `mtime` cannot be expressed in RFC 2822
    pub fn to_bytes(&self) -> Result<Vec<u8>, ControlError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Build the lookup table used by the matcher
    ///
    /// # Errors
    /// Returns an error if the block table does not tile the file
    pub fn checksum_index(&self) -> Result<ChecksumIndex, ControlError> {
        ChecksumIndex::new(
            self.block_size,
            self.length,
            usize::from(self.hash_lengths.rsum_bytes),
            usize::from(self.hash_lengths.checksum_bytes),
            self.blocks.iter().map(|b| (b.weak, b.strong)),
        )
        .map(|index| index.with_seq_matches(usize::from(self.hash_lengths.seq_matches)))
    }

    /// First download URL
    ///
    /// # Errors
    /// Returns an error if the control file lists none
    pub fn primary_url(&self) -> Result<&str, ControlError> {
        self.urls
            .first()
            .map(String::as_str)
            .ok_or(ControlError::MissingHeader("URL"))
    }

    /// Number of blocks in the target
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Whether dotted version `a` is newer than `b`
fn version_newer(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.trim().parse().unwrap_or(0)).collect() };
    parse(a) > parse(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Vec<u8> {
        (0..4156u32).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn options(block_size: u64) -> GenerateOptions {
        GenerateOptions {
            block_size,
            filename: Some("file".into()),
            mtime: Some(OffsetDateTime::from_unix_timestamp(1_465_928_074).unwrap()),
            url: Some("file".into()),
            hash_lengths: HashLengths::default(),
        }
    }

    #[test]
    fn test_generate_describes_file() {
        let data = sample_data();
        let control = ControlFile::generate(&data[..], options(2048)).unwrap();

        assert_eq!(control.length, 4156);
        assert_eq!(control.block_count(), 3);
        assert_eq!(control.sha1, Some(FileDigest::from_bytes(&data)));
        assert_eq!(
            control.blocks[2].strong,
            StrongSum::of_block(&data[4096..], 2048, 16)
        );
    }

    #[test]
    fn test_write_parse_round_trip() {
        let data = sample_data();
        let mut control = ControlFile::generate(&data[..], options(1024)).unwrap();
        control.extra_headers.push(("X-Custom".into(), "kept".into()));

        let bytes = control.to_bytes().unwrap();
        let parsed = ControlFile::parse(&bytes).unwrap();
        assert_eq!(parsed, control);
    }

    #[test]
    fn test_header_text() {
        let control = ControlFile::generate(&b"hello"[..], options(2048)).unwrap();
        let bytes = control.to_bytes().unwrap();
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.starts_with("zsync: 0.6.2\nFilename: file\n"));
        assert!(text.contains("MTime: Tue, 14 Jun 2016 18:14:34 +0000\n"));
        assert!(text.contains("Blocksize: 2048\nLength: 5\nHash-Lengths: 1,4,16\nURL: file\n"));
        assert!(text.contains("SHA-1: aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d\n\n"));
        // One block of 4 + 16 bytes after the blank line
        let header_end = text.find("\n\n").unwrap() + 2;
        assert_eq!(bytes.len() - header_end, 20);
    }

    #[test]
    fn test_truncated_hash_lengths() {
        let data = sample_data();
        let mut opts = options(2048);
        opts.hash_lengths = HashLengths {
            seq_matches: 2,
            rsum_bytes: 3,
            checksum_bytes: 5,
        };
        let control = ControlFile::generate(&data[..], opts).unwrap();
        let parsed = ControlFile::parse(&control.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed.hash_lengths.rsum_bytes, 3);
        assert_eq!(parsed.blocks[0].strong.as_bytes().len(), 5);
        assert_eq!(parsed.blocks, control.blocks);
        assert_eq!(parsed.blocks[0].weak >> 24, 0);
    }

    #[test]
    fn test_truncated_table_rejected() {
        let data = sample_data();
        let control = ControlFile::generate(&data[..], options(2048)).unwrap();
        let mut bytes = control.to_bytes().unwrap();
        bytes.pop();

        assert!(matches!(
            ControlFile::parse(&bytes),
            Err(ControlError::Truncated { expected: 60, found: 59 })
        ));
    }

    #[test]
    fn test_trailing_data_rejected() {
        let control = ControlFile::generate(&b"abc"[..], options(2048)).unwrap();
        let mut bytes = control.to_bytes().unwrap();
        bytes.extend_from_slice(b"xx");
        assert!(matches!(
            ControlFile::parse(&bytes),
            Err(ControlError::TrailingData(2))
        ));
    }

    #[test]
    fn test_huge_length_rejected() {
        let huge = b"zsync: 0.6.2\nBlocksize: 1\nLength: 18446744073709551615\nURL: x\n\n";
        assert!(matches!(
            ControlFile::parse(huge),
            Err(ControlError::InvalidIndex(_))
        ));
    }

    #[test]
    fn test_missing_headers() {
        let missing_version = b"Blocksize: 2048\nLength: 0\n\n";
        assert!(matches!(
            ControlFile::parse(missing_version),
            Err(ControlError::MissingHeader("zsync"))
        ));

        let missing_length = b"zsync: 0.6.2\nBlocksize: 2048\n\n";
        assert!(matches!(
            ControlFile::parse(missing_length),
            Err(ControlError::MissingHeader("Length"))
        ));
    }

    #[test]
    fn test_invalid_headers() {
        let bad_block_size = b"zsync: 0.6.2\nBlocksize: 1000\nLength: 0\n\n";
        assert!(matches!(
            ControlFile::parse(bad_block_size),
            Err(ControlError::InvalidHeader { .. })
        ));

        let bad_lengths = b"zsync: 0.6.2\nBlocksize: 1024\nLength: 0\nHash-Lengths: 3,4,16\n\n";
        assert!(matches!(
            ControlFile::parse(bad_lengths),
            Err(ControlError::InvalidHeader { .. })
        ));

        let no_colon = b"zsync: 0.6.2\ngarbage\n\n";
        assert!(matches!(
            ControlFile::parse(no_colon),
            Err(ControlError::MalformedLine(_))
        ));
    }

    #[test]
    fn test_compressed_only_is_unsupported() {
        let data = b"zsync: 0.6.2\nBlocksize: 1024\nLength: 0\nZ-URL: file.gz\n\n";
        assert!(matches!(
            ControlFile::parse(data),
            Err(ControlError::Unsupported(_))
        ));
    }

    #[test]
    fn test_min_version() {
        let data = b"zsync: 0.7.0\nMin-Version: 0.7.0\nBlocksize: 1024\nLength: 0\n\n";
        assert!(matches!(
            ControlFile::parse(data),
            Err(ControlError::Unsupported(_))
        ));

        let data = b"zsync: 0.6.2\nMin-Version: 0.6\nBlocksize: 1024\nLength: 0\nURL: x\n\n";
        assert!(ControlFile::parse(data).is_ok());
    }

    #[test]
    fn test_index_from_control() {
        let data = sample_data();
        let control = ControlFile::generate(&data[..], options(2048)).unwrap();
        let index = control.checksum_index().unwrap();

        assert_eq!(index.block_count(), 3);
        assert_eq!(index.total_length(), 4156);
        let weak = Rsum::of_block(&data[2048..4096], 2048).value();
        assert_eq!(index.lookup(weak)[0].target_offset, 2048);
    }

    #[test]
    fn test_default_block_size() {
        assert_eq!(default_block_size(10), 2048);
        assert_eq!(default_block_size(200 * 1024 * 1024), 4096);
    }

    #[test]
    fn test_primary_url() {
        let mut control = ControlFile::generate(&b"x"[..], options(2048)).unwrap();
        assert_eq!(control.primary_url().unwrap(), "file");
        control.urls.clear();
        assert!(control.primary_url().is_err());
    }
}
