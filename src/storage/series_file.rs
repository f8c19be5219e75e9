//! Per-series chunk files
//!
//! Every fingerprint owns one file holding its persisted chunks as
//! fixed-width records appended in time order. The path is derived from the
//! fingerprint's hex form: `<base>/<first two chars>/<remaining 14>.db`.
//!
//! Record layout (fixed width = 17 + chunk_len bytes):
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │ type_tag: u8                           │
//! │ first_time: i64 (little-endian)        │
//! │ last_time: i64 (little-endian)         │
//! │ payload: [u8; chunk_len]               │
//! └────────────────────────────────────────┘
//! ```
//!
//! Record `i` lives at byte offset `i * (17 + chunk_len)`, so chunks are
//! addressed by index without any in-file directory.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::chunk::{chunk_for_type, Chunk};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsutil;
use crate::storage::model::Fingerprint;
use crate::storage::series::ChunkDesc;

/// Bytes of the record header preceding each chunk payload.
pub const CHUNK_HEADER_LEN: usize = 17;

const CHUNK_HEADER_FIRST_TIME_OFFSET: u64 = 1;
const CHUNK_HEADER_LAST_TIME_OFFSET: u64 = 9;

const SERIES_FILE_SUFFIX: &str = ".db";
const SERIES_TEMP_FILE_SUFFIX: &str = ".db.tmp";

/// Manages the per-fingerprint chunk files below a base directory.
///
/// Callers must not run `persist`, `load`, `load_descs`, and `drop_before`
/// concurrently for the same fingerprint; holding that fingerprint's lock is
/// the way to guarantee it.
pub struct SeriesFiles {
    base_path: PathBuf,
    chunk_len: usize,
}

impl SeriesFiles {
    pub fn new(base_path: impl Into<PathBuf>, chunk_len: usize) -> Self {
        Self {
            base_path: base_path.into(),
            chunk_len,
        }
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    fn record_len(&self) -> u64 {
        (CHUNK_HEADER_LEN + self.chunk_len) as u64
    }

    fn offset_for_index(&self, index: u64) -> u64 {
        index * self.record_len()
    }

    fn index_for_offset(&self, offset: u64) -> StorageResult<u64> {
        if offset % self.record_len() != 0 {
            return Err(StorageError::InvalidChunkFile(format!(
                "offset {} is not a multiple of on-disk chunk length {}",
                offset,
                self.record_len()
            )));
        }
        Ok(offset / self.record_len())
    }

    pub fn dir_for(&self, fp: Fingerprint) -> PathBuf {
        self.base_path.join(fp.dir_part())
    }

    pub fn path_for(&self, fp: Fingerprint) -> PathBuf {
        self.dir_for(fp)
            .join(format!("{}{}", fp.file_part(), SERIES_FILE_SUFFIX))
    }

    pub fn temp_path_for(&self, fp: Fingerprint) -> PathBuf {
        self.dir_for(fp)
            .join(format!("{}{}", fp.file_part(), SERIES_TEMP_FILE_SUFFIX))
    }

    fn open_for_append(&self, fp: Fingerprint) -> StorageResult<File> {
        fsutil::ensure_dir(&self.dir_for(fp))?;
        Ok(fsutil::data_file_options()
            .append(true)
            .create(true)
            .open(self.path_for(fp))?)
    }

    fn open_for_reading(&self, fp: Fingerprint) -> io::Result<File> {
        File::open(self.path_for(fp))
    }

    /// Appends one chunk and returns its zero-based index within the file.
    /// Fails if the resulting file size is not a whole number of records.
    pub fn persist(&self, fp: Fingerprint, chunk: &dyn Chunk) -> StorageResult<u64> {
        let file = self.open_for_append(fp)?;
        let mut w = BufWriter::with_capacity(CHUNK_HEADER_LEN + self.chunk_len, &file);

        let mut header = [0u8; CHUNK_HEADER_LEN];
        header[0] = chunk.type_tag();
        header[1..9].copy_from_slice(&chunk.first_time().to_le_bytes());
        header[9..17].copy_from_slice(&chunk.last_time().to_le_bytes());
        w.write_all(&header)?;
        chunk.marshal(&mut w)?;
        w.flush()?;
        drop(w);

        let size = file.metadata()?.len();
        Ok(self.index_for_offset(size)? - 1)
    }

    /// Loads the chunks at the given indexes, with `index_offset` added to
    /// each index first.
    pub fn load(
        &self,
        fp: Fingerprint,
        indexes: &[u64],
        index_offset: u64,
    ) -> StorageResult<Vec<Box<dyn Chunk>>> {
        let mut file = self.open_for_reading(fp)?;
        let mut chunks = Vec::with_capacity(indexes.len());
        for &index in indexes {
            file.seek(SeekFrom::Start(self.offset_for_index(index + index_offset)))?;

            let mut type_buf = [0u8; 1];
            file.read_exact(&mut type_buf)?;
            file.seek(SeekFrom::Current(CHUNK_HEADER_LEN as i64 - 1))?;

            let mut chunk = chunk_for_type(type_buf[0], self.chunk_len);
            chunk.unmarshal(&mut file)?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Loads descriptors for all chunks fully before `before_time`, reading
    /// only the time fields of each record. Stops at the first record whose
    /// last time reaches the horizon; from there on, descriptors are
    /// expected in memory already.
    ///
    /// A file size that is not a whole number of records is repaired by
    /// truncating to the previous record boundary before reading.
    pub fn load_descs(&self, fp: Fingerprint, before_time: i64) -> StorageResult<Vec<ChunkDesc>> {
        let file = match self.open_for_reading(fp) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut size = file.metadata()?.len();
        if size % self.record_len() != 0 {
            let truncate_to = size - size % self.record_len();
            tracing::warn!(
                fingerprint = %fp,
                size,
                truncate_to,
                "Bad series file size, truncating to the previous record boundary"
            );
            metrics::counter!("series_file_truncations_total").increment(1);
            // The read handle cannot truncate; take a short-lived write handle.
            fsutil::data_file_options()
                .write(true)
                .open(self.path_for(fp))?
                .set_len(truncate_to)?;
            size = truncate_to;
        }

        let num_chunks = size / self.record_len();
        let mut file = file;
        let mut descs = Vec::with_capacity(num_chunks as usize);
        for i in 0..num_chunks {
            file.seek(SeekFrom::Start(
                self.offset_for_index(i) + CHUNK_HEADER_FIRST_TIME_OFFSET,
            ))?;
            let mut times = [0u8; 16];
            file.read_exact(&mut times)?;
            let first_time = i64::from_le_bytes(times[0..8].try_into().unwrap());
            let last_time = i64::from_le_bytes(times[8..16].try_into().unwrap());
            if last_time >= before_time {
                break;
            }
            descs.push(ChunkDesc::evicted(first_time, last_time));
        }
        Ok(descs)
    }

    /// Deletes all chunks whose last sample time is before `before_time`.
    /// Returns the number of dropped chunks and whether the whole file (and
    /// with it the series' presence on disk) is gone.
    pub fn drop_before(
        &self,
        fp: Fingerprint,
        before_time: i64,
    ) -> StorageResult<(u64, bool)> {
        let mut file = match self.open_for_reading(fp) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, true)),
            Err(e) => return Err(e.into()),
        };

        // Find the first record to keep.
        let mut keep_from = 0u64;
        loop {
            file.seek(SeekFrom::Start(
                self.offset_for_index(keep_from) + CHUNK_HEADER_LAST_TIME_OFFSET,
            ))?;
            let mut last_time_buf = [0u8; 8];
            match file.read_exact(&mut last_time_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Nothing to keep; remove the whole file.
                    drop(file);
                    fs::remove_file(self.path_for(fp))?;
                    return Ok((keep_from, true));
                }
                Err(e) => return Err(e.into()),
            }
            let last_time = i64::from_le_bytes(last_time_buf);
            if last_time >= before_time {
                break;
            }
            keep_from += 1;
        }

        if keep_from == 0 {
            return Ok((0, false));
        }

        // Copy everything from the first kept record into a temp file and
        // swing it into place.
        file.seek(SeekFrom::Start(self.offset_for_index(keep_from)))?;
        let mut temp = fsutil::data_file_options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.temp_path_for(fp))?;
        io::copy(&mut file, &mut temp)?;
        temp.sync_all()?;
        drop(temp);
        fs::rename(self.temp_path_for(fp), self.path_for(fp))?;

        Ok((keep_from, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chunk::DeltaChunk;
    use crate::storage::model::Sample;
    use tempfile::tempdir;

    const CHUNK_LEN: usize = 1024;

    fn series_files(dir: &Path) -> SeriesFiles {
        SeriesFiles::new(dir, CHUNK_LEN)
    }

    fn chunk_with(samples: &[(i64, f64)]) -> Box<dyn Chunk> {
        let mut chunk: Box<dyn Chunk> = Box::new(DeltaChunk::new(CHUNK_LEN));
        for &(t, v) in samples {
            chunk = chunk.add(Sample::new(t, v)).pop().unwrap();
        }
        chunk
    }

    #[test]
    fn test_persist_then_load_single_chunk() {
        let dir = tempdir().unwrap();
        let files = series_files(dir.path());
        let fp = Fingerprint(0xdead_0000_0000_0000);

        let chunk = chunk_with(&[(100, 1.0), (200, 2.0)]);
        let index = files.persist(fp, chunk.as_ref()).unwrap();
        assert_eq!(index, 0);

        let loaded = files.load(fp, &[0], 0).unwrap();
        assert_eq!(loaded.len(), 1);
        let samples: Vec<Sample> = loaded[0].iter().collect();
        assert_eq!(samples, vec![Sample::new(100, 1.0), Sample::new(200, 2.0)]);

        let path = files.path_for(fp);
        assert!(path.ends_with("de/ad000000000000.db"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 1041);
    }

    #[test]
    fn test_persist_appends_in_order() {
        let dir = tempdir().unwrap();
        let files = series_files(dir.path());
        let fp = Fingerprint(0x01);

        for i in 0..3 {
            let chunk = chunk_with(&[(i * 100, i as f64)]);
            let index = files.persist(fp, chunk.as_ref()).unwrap();
            assert_eq!(index, i as u64);
        }

        let loaded = files.load(fp, &[0, 2], 0).unwrap();
        assert_eq!(loaded[0].first_time(), 0);
        assert_eq!(loaded[1].first_time(), 200);

        // index_offset shifts every requested index.
        let loaded = files.load(fp, &[0, 1], 1).unwrap();
        assert_eq!(loaded[0].first_time(), 100);
        assert_eq!(loaded[1].first_time(), 200);
    }

    #[test]
    fn test_load_descs_respects_horizon() {
        let dir = tempdir().unwrap();
        let files = series_files(dir.path());
        let fp = Fingerprint(0x01);

        for last in [100i64, 200, 300] {
            let chunk = chunk_with(&[(last - 50, 0.0), (last, 1.0)]);
            files.persist(fp, chunk.as_ref()).unwrap();
        }

        let descs = files.load_descs(fp, 250).unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].last_time(), 100);
        assert_eq!(descs[1].last_time(), 200);

        let descs = files.load_descs(fp, i64::MAX).unwrap();
        assert_eq!(descs.len(), 3);

        // Missing file means no descriptors, not an error.
        assert!(files.load_descs(Fingerprint(0x99), 0).unwrap().is_empty());
    }

    #[test]
    fn test_load_descs_truncates_trailing_garbage() {
        let dir = tempdir().unwrap();
        let files = series_files(dir.path());
        let fp = Fingerprint(0x01);

        let chunk = chunk_with(&[(100, 1.0)]);
        files.persist(fp, chunk.as_ref()).unwrap();

        // Tack a partial record onto the end.
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(files.path_for(fp))
            .unwrap();
        f.write_all(&[0xab; 7]).unwrap();
        drop(f);

        let descs = files.load_descs(fp, i64::MAX).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(
            fs::metadata(files.path_for(fp)).unwrap().len() % (CHUNK_HEADER_LEN + CHUNK_LEN) as u64,
            0
        );
    }

    #[test]
    fn test_drop_before_prefix() {
        let dir = tempdir().unwrap();
        let files = series_files(dir.path());
        let fp = Fingerprint(0x01);

        for last in [100i64, 200, 300] {
            let chunk = chunk_with(&[(last - 50, 0.0), (last, 1.0)]);
            files.persist(fp, chunk.as_ref()).unwrap();
        }

        // Nothing earlier than the first chunk: no-op.
        assert_eq!(files.drop_before(fp, 50).unwrap(), (0, false));

        assert_eq!(files.drop_before(fp, 250).unwrap(), (2, false));
        let descs = files.load_descs(fp, i64::MAX).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].last_time(), 300);

        assert_eq!(files.drop_before(fp, 400).unwrap(), (1, true));
        assert!(!files.path_for(fp).exists());

        // Dropping on a missing file reports the series gone.
        assert_eq!(files.drop_before(fp, 400).unwrap(), (0, true));
    }

    #[test]
    fn test_file_size_is_record_multiple_after_operations() {
        let dir = tempdir().unwrap();
        let files = series_files(dir.path());
        let fp = Fingerprint(0x05);
        let record = (CHUNK_HEADER_LEN + CHUNK_LEN) as u64;

        for last in [100i64, 200, 300, 400] {
            let chunk = chunk_with(&[(last, 1.0)]);
            files.persist(fp, chunk.as_ref()).unwrap();
            assert_eq!(fs::metadata(files.path_for(fp)).unwrap().len() % record, 0);
        }

        files.drop_before(fp, 250).unwrap();
        assert_eq!(fs::metadata(files.path_for(fp)).unwrap().len() % record, 0);
    }
}
