//! Copy chunk spans from a seekable source into positioned output

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use tracing::trace;

use crate::chunks::ChunkInfo;
use crate::error::{Result, SyncError};
use crate::output::PositionedWrite;

/// Largest copy performed in one read/write step
const COPY_BUF_SIZE: usize = 1024 * 1024;

/// What a [`write_chunks`] call copied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Apply `chunks` in order: for each, copy `size` bytes from `source` at
/// `source_offset` to `output` at `target_offset`.
///
/// Bytes of `output` that no chunk covers are left untouched. Stops at the
/// first failure; whatever was already written stays written.
///
/// # Errors
/// [`SyncError::Write`] if seeking, reading or writing fails, and
/// [`SyncError::SourceExhausted`] if the source ends inside a chunk.
pub fn write_chunks<S, O>(
    source: &mut S,
    output: &O,
    chunks: impl IntoIterator<Item = ChunkInfo>,
) -> Result<WriteStats>
where
    S: Read + Seek + ?Sized,
    O: PositionedWrite + ?Sized,
{
    let mut stats = WriteStats::default();
    let mut buffer = Vec::new();

    for chunk in chunks {
        trace!(
            source_offset = chunk.source_offset,
            target_offset = chunk.target_offset,
            size = chunk.size,
            "writing chunk"
        );
        let write_err = |source| SyncError::Write {
            offset: chunk.target_offset,
            len: chunk.size,
            source,
        };

        source
            .seek(SeekFrom::Start(chunk.source_offset))
            .map_err(write_err)?;

        let mut copied = 0u64;
        while copied < chunk.size {
            let step = (chunk.size - copied).min(COPY_BUF_SIZE as u64) as usize;
            buffer.resize(step, 0);

            let filled = fill(source, &mut buffer).map_err(write_err)?;
            if filled < step {
                return Err(SyncError::SourceExhausted {
                    offset: chunk.source_offset + copied + filled as u64,
                    wanted: chunk.size - copied - filled as u64,
                });
            }

            output
                .write_all_at(&buffer, chunk.target_offset + copied)
                .map_err(write_err)?;
            copied += step as u64;
        }

        stats.chunks += 1;
        stats.bytes += chunk.size;
    }

    Ok(stats)
}

/// Read until `buf` is full or the source ends; short reads are retried
fn fill<S: Read + ?Sized>(source: &mut S, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
