//! zsync2-core: block matching and reconstruction engine
//!
//! Parses zsync control files, finds reusable blocks in local seed files,
//! and rebuilds the target by copying those blocks and fetching the rest.

pub mod chunks;
pub mod config;
pub mod control;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod index;
pub mod matcher;
pub mod output;
pub mod rsum;
pub mod sync;
pub mod writer;

pub use chunks::{ByteRange, ChunkInfo, complement, split_requests};
pub use config::Zsync2Config;
pub use control::{ControlFile, GenerateOptions, HashLengths};
pub use error::{ControlError, FetchError, SyncError};
pub use fetch::{RangeReader, RemoteFetcher, read_body, read_range};
pub use hash::{FileDigest, StrongSum};
pub use index::{BlockDescriptor, ChecksumIndex};
pub use matcher::{ChunkMatcher, ChunkStream, MatchStats};
pub use output::{OutputFile, PositionedWrite};
pub use rsum::Rsum;
pub use sync::{SyncOptions, SyncReport, Syncer};
pub use writer::{WriteStats, write_chunks};
