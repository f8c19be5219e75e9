//! Vigil persistence layer
//!
//! This module provides the core on-disk storage functionality:
//!
//! - **model**: Core data types (Fingerprint, Metric, Sample, TimeRange)
//! - **codec**: Bit-exact binary encoders and decoders
//! - **chunk**: Sample chunk contract and the delta-encoded chunk
//! - **series**: In-memory series map and chunk descriptors
//! - **locker**: Per-fingerprint locking with a bounded lock pool
//! - **series_file**: Per-series chunk files
//! - **heads**: The heads checkpoint
//! - **persistence**: The facade orchestrating all of the above
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write path:
//!   completed chunk → series file (fixed-width records, append)
//!   label ops → bounded queue → single consumer → batched KV commits
//!
//! Crash safety:
//!   heads checkpoint (write temp + rename) + DIRTY marker
//!   → two-stage dirty recovery on unclean startup
//! ```

pub mod chunk;
pub mod codec;
pub mod error;
pub(crate) mod fsutil;
pub mod heads;
pub mod locker;
pub mod model;
pub mod persistence;
pub mod series;
pub mod series_file;

// Re-export commonly used types
pub use chunk::{chunk_for_type, transcode_and_add, Chunk, DeltaChunk, DELTA_CHUNK_TYPE};
pub use error::{StorageError, StorageResult};
pub use heads::{HeadsCheckpoint, LoadedHeads, HEADS_FORMAT_VERSION, HEADS_MAGIC};
pub use locker::{FingerprintGuard, FingerprintLocker};
pub use model::{Fingerprint, LabelName, LabelPair, LabelValue, Metric, Sample, TimeRange};
pub use persistence::{
    Persistence, INDEXING_BATCH_TIMEOUT, INDEXING_MAX_BATCH_SIZE, INDEXING_QUEUE_CAPACITY,
};
pub use series::{ChunkDesc, MemorySeries, SeriesMap};
pub use series_file::{SeriesFiles, CHUNK_HEADER_LEN};
