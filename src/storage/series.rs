//! In-memory series bookkeeping
//!
//! A live series keeps its recent chunks described by [`ChunkDesc`]s, ordered
//! oldest to newest. Descriptors without an in-memory chunk stand for chunks
//! that only exist in the series file on disk. The last descriptor is the
//! head: if `head_chunk_persisted` is false, the head chunk is in memory and
//! still mutable.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::storage::chunk::Chunk;
use crate::storage::model::{Fingerprint, Metric, Sample};

/// Metadata for one chunk of a series: its time range, an optional in-memory
/// chunk, and a pin count used by readers to keep evictable chunks resident.
pub struct ChunkDesc {
    first_time: i64,
    last_time: i64,
    chunk: Option<Box<dyn Chunk>>,
    pin_count: usize,
}

impl ChunkDesc {
    /// A descriptor holding the given in-memory chunk.
    pub fn new(chunk: Box<dyn Chunk>) -> Self {
        Self {
            first_time: chunk.first_time(),
            last_time: chunk.last_time(),
            chunk: Some(chunk),
            pin_count: 0,
        }
    }

    /// A descriptor for a chunk that lives on disk only.
    pub fn evicted(first_time: i64, last_time: i64) -> Self {
        Self {
            first_time,
            last_time,
            chunk: None,
            pin_count: 0,
        }
    }

    /// First sample time. Read from the chunk while it is resident, since
    /// the head chunk still mutates.
    pub fn first_time(&self) -> i64 {
        match &self.chunk {
            Some(c) => c.first_time(),
            None => self.first_time,
        }
    }

    /// Last sample time.
    pub fn last_time(&self) -> i64 {
        match &self.chunk {
            Some(c) => c.last_time(),
            None => self.last_time,
        }
    }

    pub fn chunk(&self) -> Option<&dyn Chunk> {
        self.chunk.as_deref()
    }

    pub fn has_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    /// Drops the in-memory chunk, keeping its time range.
    pub fn evict(&mut self) {
        if let Some(c) = self.chunk.take() {
            self.first_time = c.first_time();
            self.last_time = c.last_time();
        }
    }

    /// Replaces the in-memory chunk (used when resurrecting from disk).
    pub fn set_chunk(&mut self, chunk: Box<dyn Chunk>) {
        self.first_time = chunk.first_time();
        self.last_time = chunk.last_time();
        self.chunk = Some(chunk);
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub fn unpin(&mut self) {
        debug_assert!(self.pin_count > 0, "unpin without matching pin");
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    fn samples(&self) -> Option<Vec<Sample>> {
        self.chunk.as_ref().map(|c| c.iter().collect())
    }
}

impl std::fmt::Debug for ChunkDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDesc")
            .field("first_time", &self.first_time())
            .field("last_time", &self.last_time())
            .field("has_chunk", &self.has_chunk())
            .finish()
    }
}

impl PartialEq for ChunkDesc {
    fn eq(&self, other: &Self) -> bool {
        // Pin counts are runtime state, not identity.
        self.first_time() == other.first_time()
            && self.last_time() == other.last_time()
            && self.samples() == other.samples()
    }
}

/// The in-memory state of one live series.
#[derive(Debug, PartialEq)]
pub struct MemorySeries {
    pub metric: Metric,
    /// Chunk descriptors, oldest to newest. The last one is the head.
    pub chunk_descs: Vec<ChunkDesc>,
    /// Index of `chunk_descs[0]` relative to the complete on-disk series.
    /// `-1` means the offset is unknown until the series file is consulted.
    pub chunk_descs_offset: i64,
    /// Whether the head chunk has already been written to the series file.
    pub head_chunk_persisted: bool,
}

impl MemorySeries {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            chunk_descs: Vec::new(),
            chunk_descs_offset: 0,
            head_chunk_persisted: false,
        }
    }

    /// Number of chunks of this series in its series file, or `None` while
    /// the descriptor offset is unknown.
    pub fn chunks_on_disk(&self) -> Option<i64> {
        if self.chunk_descs_offset < 0 {
            return None;
        }
        let in_memory_head = if self.head_chunk_persisted { 0 } else { 1 };
        Some(self.chunk_descs_offset + self.chunk_descs.len() as i64 - in_memory_head)
    }

    pub fn head(&self) -> Option<&ChunkDesc> {
        self.chunk_descs.last()
    }
}

/// The fingerprint → memory-series mapping shared between the ingest layer
/// and the persistence layer. Lock a fingerprint before mutating its series;
/// the map itself only guards its own structure.
#[derive(Default)]
pub struct SeriesMap {
    m: RwLock<HashMap<Fingerprint, MemorySeries>>,
}

impl SeriesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.m.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.read().unwrap().is_empty()
    }

    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.m.read().unwrap().contains_key(&fp)
    }

    pub fn insert(&self, fp: Fingerprint, series: MemorySeries) {
        self.m.write().unwrap().insert(fp, series);
    }

    pub fn remove(&self, fp: Fingerprint) -> Option<MemorySeries> {
        self.m.write().unwrap().remove(&fp)
    }

    /// A snapshot of the fingerprints currently in the map. Series may be
    /// added or purged while the snapshot is being worked through.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.m.read().unwrap().keys().copied().collect()
    }

    /// Runs `f` against the series for `fp`, if present.
    pub fn with<R>(&self, fp: Fingerprint, f: impl FnOnce(&MemorySeries) -> R) -> Option<R> {
        self.m.read().unwrap().get(&fp).map(f)
    }

    /// Runs `f` against the mutable series for `fp`, if present.
    pub fn with_mut<R>(
        &self,
        fp: Fingerprint,
        f: impl FnOnce(&mut MemorySeries) -> R,
    ) -> Option<R> {
        self.m.write().unwrap().get_mut(&fp).map(f)
    }
}

impl std::fmt::Debug for SeriesMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.m.read().unwrap().fmt(f)
    }
}

impl PartialEq for SeriesMap {
    fn eq(&self, other: &Self) -> bool {
        *self.m.read().unwrap() == *other.m.read().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chunk::DeltaChunk;
    use crate::storage::model::Sample;

    fn chunk_with(samples: &[(i64, f64)]) -> Box<dyn Chunk> {
        let mut chunk: Box<dyn Chunk> = Box::new(DeltaChunk::new(1024));
        for &(t, v) in samples {
            chunk = chunk.add(Sample::new(t, v)).pop().unwrap();
        }
        chunk
    }

    #[test]
    fn test_chunk_desc_times_follow_resident_chunk() {
        let desc = ChunkDesc::new(chunk_with(&[(100, 1.0), (200, 2.0)]));
        assert_eq!(desc.first_time(), 100);
        assert_eq!(desc.last_time(), 200);

        let desc = ChunkDesc::evicted(300, 400);
        assert!(!desc.has_chunk());
        assert_eq!(desc.first_time(), 300);
        assert_eq!(desc.last_time(), 400);
    }

    #[test]
    fn test_chunk_desc_evict_keeps_times() {
        let mut desc = ChunkDesc::new(chunk_with(&[(100, 1.0), (200, 2.0)]));
        desc.evict();
        assert!(!desc.has_chunk());
        assert_eq!(desc.first_time(), 100);
        assert_eq!(desc.last_time(), 200);
    }

    #[test]
    fn test_chunks_on_disk() {
        let mut s = MemorySeries::new(Metric::from_pairs(&[("job", "api")]));
        s.chunk_descs.push(ChunkDesc::evicted(0, 100));
        s.chunk_descs.push(ChunkDesc::new(chunk_with(&[(200, 1.0)])));
        s.chunk_descs_offset = 3;

        // Head is in memory: one descriptor does not count.
        assert_eq!(s.chunks_on_disk(), Some(4));

        s.head_chunk_persisted = true;
        assert_eq!(s.chunks_on_disk(), Some(5));

        s.chunk_descs_offset = -1;
        assert_eq!(s.chunks_on_disk(), None);
    }

    #[test]
    fn test_series_map_basics() {
        let map = SeriesMap::new();
        let fp = Fingerprint(0x42);
        assert!(map.is_empty());

        map.insert(fp, MemorySeries::new(Metric::from_pairs(&[("job", "api")])));
        assert_eq!(map.len(), 1);
        assert!(map.contains(fp));

        let job = map
            .with(fp, |s| s.metric.get("job").cloned())
            .flatten()
            .unwrap();
        assert_eq!(job, "api");

        map.with_mut(fp, |s| s.head_chunk_persisted = true);
        assert_eq!(map.with(fp, |s| s.head_chunk_persisted), Some(true));

        assert!(map.remove(fp).is_some());
        assert!(map.is_empty());
    }
}
