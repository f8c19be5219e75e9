//! # Vigil
//!
//! Local, on-disk time-series persistence for a metrics monitoring system.
//!
//! Vigil stores ordered samples for many time series, each identified by a
//! stable 64-bit fingerprint. Completed chunks go to per-series files,
//! labels are resolvable through four KV-backed indexes fed by a batching
//! queue, and the in-memory series map survives restarts via a checkpoint
//! file plus a two-stage dirty-recovery procedure.
//!
//! ## Modules
//!
//! - [`storage`]: chunk files, checkpointing, archival, crash recovery
//! - [`index`]: the KV-backed label and archive indexes
//! - [`config`]: configuration supplied by the embedding application
//!
//! Telemetry is emitted through the `metrics` facade (gauges
//! `indexing_queue_length`, `indexing_queue_capacity`,
//! `checkpoint_duration_milliseconds`; histograms `indexing_batch_sizes`,
//! `indexing_batch_latency_milliseconds`); install any recorder to export
//! them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil::config::Config;
//! use vigil::storage::{
//!     Chunk, DeltaChunk, Fingerprint, FingerprintLocker, Persistence, Sample,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new("./data");
//!     let persistence = Arc::new(Persistence::new(&config).await?);
//!     let locker = FingerprintLocker::new(256);
//!
//!     // Restore the series map from the last checkpoint (runs dirty
//!     // recovery if the previous shutdown was unclean).
//!     let series_map = persistence.load_series_map_and_heads().await?;
//!
//!     // Persist a completed chunk for a series.
//!     let fp = Fingerprint(0xdead_0000_0000_0000);
//!     let chunk: Box<dyn Chunk> = Box::new(DeltaChunk::new(config.chunk_len));
//!     let chunk = chunk.add(Sample::new(1000, 42.0)).pop().unwrap();
//!     {
//!         let _guard = locker.lock(fp).await;
//!         persistence.persist_chunk(fp, chunk.as_ref())?;
//!     }
//!
//!     // Checkpoint and shut down cleanly.
//!     persistence
//!         .checkpoint_series_map_and_heads(&series_map, &locker)
//!         .await?;
//!     persistence.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError};

pub use storage::{
    Chunk, ChunkDesc, DeltaChunk, Fingerprint, FingerprintLocker, LabelName, LabelPair,
    LabelValue, MemorySeries, Metric, Persistence, Sample, SeriesMap, StorageError,
    StorageResult, TimeRange,
};

pub use index::{
    Batch, FingerprintMetricIndex, FingerprintTimeRangeIndex, KeyValueStore,
    LabelNameLabelValuesIndex, LabelPairFingerprintsIndex, SqliteStore,
};
