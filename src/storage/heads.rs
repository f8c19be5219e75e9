//! Heads checkpoint file
//!
//! The checkpoint captures the whole live series map (per-series metadata,
//! chunk descriptors, and the still-mutable head chunks) in a single file
//! so a restart can pick up where ingestion left off. It is written to a
//! temp file and renamed into place, so a crash mid-checkpoint leaves the
//! previous checkpoint intact.
//!
//! Layout:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ magic: "PrometheusHeads" (ASCII)                      │
//! │ version: varint = 1                                   │
//! │ n_series: u64 (little-endian, fixed width so it can   │
//! │           be rewritten in place when the count drifts)│
//! │ per series:                                           │
//! │   flags: u8 (bit 0 = head chunk persisted)            │
//! │   fingerprint: u64 (little-endian)                    │
//! │   metric: canonical serialization                     │
//! │   chunk_descs_offset: varint                          │
//! │   n_chunk_descs: varint                               │
//! │   per descriptor:                                     │
//! │     evicted or persisted head:                        │
//! │       first_time: varint                              │
//! │       last_time: varint                               │
//! │     in-memory head (always the last descriptor):      │
//! │       type_tag: u8                                    │
//! │       chunk payload: exactly chunk_len bytes          │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The head-chunk branch is the only encoding fork in the loop: a series
//! whose head chunk is not yet persisted stores the full chunk payload in
//! its last descriptor slot instead of the time pair.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::storage::chunk::chunk_for_type;
use crate::storage::codec::{
    read_metric, read_u64_le, read_varint, write_metric, write_u64_le, write_varint,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsutil;
use crate::storage::locker::FingerprintLocker;
use crate::storage::model::Fingerprint;
use crate::storage::series::{ChunkDesc, MemorySeries, SeriesMap};

pub const HEADS_MAGIC: &[u8] = b"PrometheusHeads";
pub const HEADS_FORMAT_VERSION: i64 = 1;

const HEADS_FILE_NAME: &str = "heads.db";
const HEADS_TEMP_FILE_NAME: &str = "heads.db.tmp";

const FLAG_HEAD_CHUNK_PERSISTED: u8 = 1;

const FILE_BUF_SIZE: usize = 1 << 16;

/// The outcome of reading a checkpoint.
pub struct LoadedHeads {
    pub series_map: SeriesMap,
    /// Whether the load hit corruption and the series map is best-effort.
    pub dirty: bool,
    /// In-memory head chunks restored.
    pub num_chunks: u64,
    /// Chunk descriptors restored.
    pub num_chunk_descs: u64,
}

/// Reads and writes the heads checkpoint below a base directory.
pub struct HeadsCheckpoint {
    base_path: PathBuf,
    chunk_len: usize,
}

impl HeadsCheckpoint {
    pub fn new(base_path: impl Into<PathBuf>, chunk_len: usize) -> Self {
        Self {
            base_path: base_path.into(),
            chunk_len,
        }
    }

    pub fn file_name(&self) -> PathBuf {
        self.base_path.join(HEADS_FILE_NAME)
    }

    pub fn temp_file_name(&self) -> PathBuf {
        self.base_path.join(HEADS_TEMP_FILE_NAME)
    }

    /// Writes a checkpoint of the series map. Each series is snapshotted
    /// under its fingerprint lock; cross-series snapshots are not atomic.
    /// Series whose descriptors were purged concurrently are skipped, and
    /// the fixed-width series count is rewritten if the total drifted while
    /// iterating.
    pub async fn write(
        &self,
        series_map: &SeriesMap,
        locker: &FingerprintLocker,
    ) -> StorageResult<()> {
        let file = fsutil::data_file_options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.temp_file_name())?;
        let mut w = BufWriter::with_capacity(FILE_BUF_SIZE, file);

        w.write_all(HEADS_MAGIC)?;
        let mut count_offset = HEADS_MAGIC.len();
        count_offset += write_varint(&mut w, HEADS_FORMAT_VERSION)?;
        let count_in_header = series_map.len() as u64;
        write_u64_le(&mut w, count_in_header)?;

        let mut real_count = 0u64;
        for fp in series_map.fingerprints() {
            let _guard = locker.lock(fp).await;
            let written = series_map
                .with(fp, |series| {
                    if series.chunk_descs.is_empty() {
                        // Purged or archived in the meantime; skip.
                        return Ok::<bool, StorageError>(false);
                    }
                    write_series(&mut w, fp, series)?;
                    Ok(true)
                })
                .transpose()?;
            if written == Some(true) {
                real_count += 1;
            }
        }

        w.flush()?;
        let mut file = w
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        if real_count != count_in_header {
            file.seek(SeekFrom::Start(count_offset as u64))?;
            write_u64_le(&mut file, real_count)?;
        }
        file.sync_all()?;
        drop(file);

        std::fs::rename(self.temp_file_name(), self.file_name())?;
        Ok(())
    }

    /// Loads the checkpoint. A missing file yields an empty, clean map. Any
    /// corruption (bad magic, unknown version, decode failure) flags the
    /// result dirty and returns whatever was decoded up to that point
    /// rather than failing the startup.
    pub fn read(&self) -> StorageResult<LoadedHeads> {
        let mut loaded = LoadedHeads {
            series_map: SeriesMap::new(),
            dirty: false,
            num_chunks: 0,
            num_chunk_descs: 0,
        };

        let file = match File::open(self.file_name()) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(loaded),
            Err(e) => {
                tracing::warn!(error = %e, "Could not open heads file");
                loaded.dirty = true;
                return Ok(loaded);
            }
        };
        let mut r = BufReader::with_capacity(FILE_BUF_SIZE, file);

        if let Err(e) = self.read_into(&mut r, &mut loaded) {
            tracing::warn!(error = %e, "Error reading heads file");
            loaded.dirty = true;
        }
        Ok(loaded)
    }

    fn read_into(
        &self,
        r: &mut impl Read,
        loaded: &mut LoadedHeads,
    ) -> StorageResult<()> {
        let mut magic = [0u8; 15];
        r.read_exact(&mut magic)?;
        if &magic[..] != HEADS_MAGIC {
            return Err(StorageError::Corruption(format!(
                "unexpected magic string, want {:?}, got {:?}",
                String::from_utf8_lossy(HEADS_MAGIC),
                String::from_utf8_lossy(&magic)
            )));
        }
        let version = read_varint(r)?;
        if version != HEADS_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unknown heads format version {}, want {}",
                version, HEADS_FORMAT_VERSION
            )));
        }

        let num_series = read_u64_le(r)?;
        for _ in 0..num_series {
            let (fp, series) = self.read_series(r, loaded)?;
            loaded.series_map.insert(fp, series);
        }
        Ok(())
    }

    fn read_series(
        &self,
        r: &mut impl Read,
        loaded: &mut LoadedHeads,
    ) -> StorageResult<(Fingerprint, MemorySeries)> {
        let mut flags = [0u8; 1];
        r.read_exact(&mut flags)?;
        let head_chunk_persisted = flags[0] & FLAG_HEAD_CHUNK_PERSISTED != 0;

        let fp = Fingerprint(read_u64_le(r)?);
        let metric = read_metric(r)?;
        let chunk_descs_offset = read_varint(r)?;
        let num_chunk_descs = read_varint(r)?;
        if num_chunk_descs < 0 {
            return Err(StorageError::Corruption(format!(
                "negative chunk descriptor count {}",
                num_chunk_descs
            )));
        }

        let mut chunk_descs = Vec::with_capacity(num_chunk_descs as usize);
        for i in 0..num_chunk_descs {
            if head_chunk_persisted || i < num_chunk_descs - 1 {
                let first_time = read_varint(r)?;
                let last_time = read_varint(r)?;
                chunk_descs.push(ChunkDesc::evicted(first_time, last_time));
            } else {
                // The in-memory head chunk, stored in full.
                let mut type_tag = [0u8; 1];
                r.read_exact(&mut type_tag)?;
                let mut chunk = chunk_for_type(type_tag[0], self.chunk_len);
                chunk.unmarshal(r)?;
                chunk_descs.push(ChunkDesc::new(chunk));
                loaded.num_chunks += 1;
            }
            loaded.num_chunk_descs += 1;
        }

        Ok((
            fp,
            MemorySeries {
                metric,
                chunk_descs,
                chunk_descs_offset,
                head_chunk_persisted,
            },
        ))
    }
}

fn write_series(
    w: &mut impl Write,
    fp: Fingerprint,
    series: &MemorySeries,
) -> StorageResult<()> {
    let mut flags = 0u8;
    if series.head_chunk_persisted {
        flags |= FLAG_HEAD_CHUNK_PERSISTED;
    }
    w.write_all(&[flags])?;
    write_u64_le(w, fp.0)?;
    write_metric(w, &series.metric)?;
    write_varint(w, series.chunk_descs_offset)?;
    write_varint(w, series.chunk_descs.len() as i64)?;

    let last = series.chunk_descs.len() - 1;
    for (i, desc) in series.chunk_descs.iter().enumerate() {
        if series.head_chunk_persisted || i < last {
            write_varint(w, desc.first_time())?;
            write_varint(w, desc.last_time())?;
        } else {
            let chunk = desc.chunk().ok_or_else(|| {
                StorageError::Corruption(format!(
                    "series {} head chunk flagged in-memory but not resident",
                    fp
                ))
            })?;
            w.write_all(&[chunk.type_tag()])?;
            chunk.marshal(w)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chunk::{Chunk, DeltaChunk};
    use crate::storage::model::{Metric, Sample};
    use std::fs;
    use tempfile::tempdir;

    const CHUNK_LEN: usize = 1024;

    fn chunk_with(samples: &[(i64, f64)]) -> Box<dyn Chunk> {
        let mut chunk: Box<dyn Chunk> = Box::new(DeltaChunk::new(CHUNK_LEN));
        for &(t, v) in samples {
            chunk = chunk.add(Sample::new(t, v)).pop().unwrap();
        }
        chunk
    }

    fn sample_series_map() -> SeriesMap {
        let map = SeriesMap::new();

        // All chunks on disk: descriptors only.
        let mut persisted = MemorySeries::new(Metric::from_pairs(&[("job", "api")]));
        persisted.head_chunk_persisted = true;
        persisted.chunk_descs_offset = 2;
        for i in 0..4i64 {
            persisted
                .chunk_descs
                .push(ChunkDesc::evicted(i * 100, i * 100 + 50));
        }
        map.insert(Fingerprint(0x11), persisted);

        // Head chunk still in memory.
        let mut live = MemorySeries::new(Metric::from_pairs(&[("job", "db"), ("env", "prod")]));
        live.chunk_descs.push(ChunkDesc::evicted(0, 99));
        live.chunk_descs
            .push(ChunkDesc::new(chunk_with(&[(100, 1.0), (200, 2.0)])));
        map.insert(Fingerprint(0x22), live);

        map
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let dir = tempdir().unwrap();
        let heads = HeadsCheckpoint::new(dir.path(), CHUNK_LEN);
        let locker = FingerprintLocker::new(8);
        let map = sample_series_map();

        heads.write(&map, &locker).await.unwrap();

        // The file announces itself.
        let bytes = fs::read(heads.file_name()).unwrap();
        assert!(bytes.starts_with(HEADS_MAGIC));

        let loaded = heads.read().unwrap();
        assert!(!loaded.dirty);
        assert_eq!(loaded.series_map, map);
        assert_eq!(loaded.num_chunks, 1);
        assert_eq!(loaded.num_chunk_descs, 6);
    }

    #[tokio::test]
    async fn test_checkpoint_skips_empty_series() {
        let dir = tempdir().unwrap();
        let heads = HeadsCheckpoint::new(dir.path(), CHUNK_LEN);
        let locker = FingerprintLocker::new(8);

        let map = sample_series_map();
        map.insert(
            Fingerprint(0x33),
            MemorySeries::new(Metric::from_pairs(&[("job", "purged")])),
        );

        heads.write(&map, &locker).await.unwrap();
        let loaded = heads.read().unwrap();
        assert!(!loaded.dirty);
        assert_eq!(loaded.series_map.len(), 2);
        assert!(!loaded.series_map.contains(Fingerprint(0x33)));
    }

    #[test]
    fn test_missing_file_is_clean_and_empty() {
        let dir = tempdir().unwrap();
        let heads = HeadsCheckpoint::new(dir.path(), CHUNK_LEN);
        let loaded = heads.read().unwrap();
        assert!(!loaded.dirty);
        assert!(loaded.series_map.is_empty());
    }

    #[test]
    fn test_bad_magic_flags_dirty() {
        let dir = tempdir().unwrap();
        let heads = HeadsCheckpoint::new(dir.path(), CHUNK_LEN);
        fs::write(heads.file_name(), b"GARBAGE").unwrap();

        let loaded = heads.read().unwrap();
        assert!(loaded.dirty);
        assert!(loaded.series_map.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_file_returns_partial_map() {
        let dir = tempdir().unwrap();
        let heads = HeadsCheckpoint::new(dir.path(), CHUNK_LEN);
        let locker = FingerprintLocker::new(8);
        let map = sample_series_map();
        heads.write(&map, &locker).await.unwrap();

        // Chop the tail off the checkpoint.
        let bytes = fs::read(heads.file_name()).unwrap();
        fs::write(heads.file_name(), &bytes[..bytes.len() - 64]).unwrap();

        let loaded = heads.read().unwrap();
        assert!(loaded.dirty);
        assert!(loaded.series_map.len() < 2);
    }

    #[tokio::test]
    async fn test_single_inmemory_head_serializes_payload() {
        let dir = tempdir().unwrap();
        let heads = HeadsCheckpoint::new(dir.path(), CHUNK_LEN);
        let locker = FingerprintLocker::new(8);

        let map = SeriesMap::new();
        let mut series = MemorySeries::new(Metric::from_pairs(&[("job", "solo")]));
        series
            .chunk_descs
            .push(ChunkDesc::new(chunk_with(&[(5, 0.5)])));
        map.insert(Fingerprint(0x44), series);

        heads.write(&map, &locker).await.unwrap();

        // One series, one in-memory head: the record must carry the whole
        // chunk payload rather than the (first, last) pair.
        let size = fs::metadata(heads.file_name()).unwrap().len();
        assert!(size > CHUNK_LEN as u64);

        let loaded = heads.read().unwrap();
        assert!(!loaded.dirty);
        assert_eq!(loaded.num_chunks, 1);
        assert_eq!(loaded.series_map, map);
    }
}
