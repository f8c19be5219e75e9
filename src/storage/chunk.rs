//! Sample chunks
//!
//! A chunk is an append-only container of (timestamp, value) samples with a
//! fixed maximum encoded size. The persistence layer treats chunks as opaque
//! through the [`Chunk`] trait; the only encoding shipped here is the
//! delta-encoded chunk (type tag `0`).
//!
//! `DeltaChunk` payload layout (always padded to exactly `chunk_len` bytes
//! on disk):
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ count: u16 (little-endian)               │
//! │ first sample:                            │
//! │   timestamp: i64 (little-endian)         │
//! │   value: f64 (little-endian)             │
//! │ subsequent samples:                      │
//! │   dt: uvarint (delta to previous sample) │
//! │   value: f64 (little-endian)             │
//! │ zero padding up to chunk_len             │
//! └──────────────────────────────────────────┘
//! ```

use std::io::{Read, Write};

use crate::storage::codec::{read_uvarint, write_uvarint};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::model::Sample;

/// Type tag of the delta-encoded chunk.
pub const DELTA_CHUNK_TYPE: u8 = 0;

/// An opaque, append-only container of samples.
///
/// Chunks are not goroutine-safe; callers serialize access per series.
pub trait Chunk: Send + Sync {
    /// Appends a sample. Returns the resulting chunks in time order; the
    /// last element is the new head (it may be the receiver itself). The
    /// receiver is consumed, so callers adopt the returned sequence.
    fn add(self: Box<Self>, sample: Sample) -> Vec<Box<dyn Chunk>>;

    /// Timestamp of the first sample. Must not be called on an empty chunk.
    fn first_time(&self) -> i64;

    /// Timestamp of the last sample. Must not be called on an empty chunk.
    fn last_time(&self) -> i64;

    /// Writes the payload, exactly `chunk_len` bytes (padded internally).
    fn marshal(&self, w: &mut dyn Write) -> StorageResult<()>;

    /// Reads a payload of exactly `chunk_len` bytes.
    fn unmarshal(&mut self, r: &mut dyn Read) -> StorageResult<()>;

    /// In-order iteration over the samples. Not restartable.
    fn iter(&self) -> Box<dyn Iterator<Item = Sample> + '_>;

    /// Discriminates chunk encodings on disk.
    fn type_tag(&self) -> u8;
}

/// Constructs an empty chunk for the given on-disk type tag.
///
/// An unknown tag is fatal: every byte tag in a chunk file must be from the
/// known set, so anything else indicates corruption the caller cannot
/// recover from here.
pub fn chunk_for_type(type_tag: u8, chunk_len: usize) -> Box<dyn Chunk> {
    match type_tag {
        DELTA_CHUNK_TYPE => Box::new(DeltaChunk::new(chunk_len)),
        _ => panic!("unknown chunk type {}", type_tag),
    }
}

/// Replays `src` into the empty chunk `dst`, collecting overflow chunks,
/// then appends `s`. Used when switching a series to another encoding.
pub fn transcode_and_add(
    dst: Box<dyn Chunk>,
    src: &dyn Chunk,
    s: Sample,
) -> Vec<Box<dyn Chunk>> {
    let mut head = dst;
    let mut body = Vec::new();
    for sample in src.iter() {
        let mut chunks = head.add(sample);
        head = chunks.pop().expect("add returned no chunks");
        body.append(&mut chunks);
    }
    let mut chunks = head.add(s);
    head = chunks.pop().expect("add returned no chunks");
    body.append(&mut chunks);
    body.push(head);
    body
}

/// The delta-encoded chunk: the first sample is stored verbatim, every
/// following sample as a varint time delta plus its value.
pub struct DeltaChunk {
    /// Encoded payload so far, starting with the u16 sample count.
    buf: Vec<u8>,
    count: usize,
    first_time: i64,
    last_time: i64,
    chunk_len: usize,
}

impl DeltaChunk {
    pub fn new(chunk_len: usize) -> Self {
        // Room for the count plus at least one verbatim sample.
        assert!(chunk_len >= 18, "chunk_len {} too small", chunk_len);
        Self {
            buf: vec![0u8; 2],
            count: 0,
            first_time: 0,
            last_time: 0,
            chunk_len,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded bytes the given sample would occupy if appended now.
    fn encoded_size(&self, s: &Sample) -> usize {
        if self.count == 0 {
            16
        } else {
            let dt = (s.timestamp - self.last_time) as u64;
            uvarint_len(dt) + 8
        }
    }

    fn push(&mut self, s: Sample) {
        if self.count == 0 {
            self.buf.extend_from_slice(&s.timestamp.to_le_bytes());
            self.first_time = s.timestamp;
        } else {
            let dt = (s.timestamp - self.last_time) as u64;
            write_uvarint(&mut self.buf, dt).expect("vec write cannot fail");
        }
        self.buf.extend_from_slice(&s.value.to_le_bytes());
        self.last_time = s.timestamp;
        self.count += 1;
        let count = self.count as u16;
        self.buf[0..2].copy_from_slice(&count.to_le_bytes());
    }
}

fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

impl Chunk for DeltaChunk {
    fn add(mut self: Box<Self>, sample: Sample) -> Vec<Box<dyn Chunk>> {
        // Out-of-order samples and full chunks both overflow into a fresh
        // chunk so the on-disk time ordering invariant holds.
        let fits = self.buf.len() + self.encoded_size(&sample) <= self.chunk_len;
        let in_order = self.count == 0 || sample.timestamp >= self.last_time;
        if fits && in_order {
            self.push(sample);
            vec![self]
        } else {
            let mut next = Box::new(DeltaChunk::new(self.chunk_len));
            next.push(sample);
            vec![self, next]
        }
    }

    fn first_time(&self) -> i64 {
        self.first_time
    }

    fn last_time(&self) -> i64 {
        self.last_time
    }

    fn marshal(&self, w: &mut dyn Write) -> StorageResult<()> {
        w.write_all(&self.buf)?;
        let padding = vec![0u8; self.chunk_len - self.buf.len()];
        w.write_all(&padding)?;
        Ok(())
    }

    fn unmarshal(&mut self, r: &mut dyn Read) -> StorageResult<()> {
        let mut payload = vec![0u8; self.chunk_len];
        r.read_exact(&mut payload)?;

        let count = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let mut cursor = &payload[2..];
        let mut first_time = 0i64;
        let mut last_time = 0i64;
        for i in 0..count {
            let timestamp = if i == 0 {
                let mut ts = [0u8; 8];
                cursor
                    .read_exact(&mut ts)
                    .map_err(|_| StorageError::Corruption("truncated delta chunk".into()))?;
                i64::from_le_bytes(ts)
            } else {
                let dt = read_uvarint(&mut cursor)?;
                last_time + dt as i64
            };
            let mut value = [0u8; 8];
            cursor
                .read_exact(&mut value)
                .map_err(|_| StorageError::Corruption("truncated delta chunk".into()))?;
            if i == 0 {
                first_time = timestamp;
            }
            last_time = timestamp;
        }

        let used = self.chunk_len - cursor.len();
        payload.truncate(used);
        self.buf = payload;
        self.count = count;
        self.first_time = first_time;
        self.last_time = last_time;
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Sample> + '_> {
        Box::new(DeltaChunkIter {
            cursor: &self.buf[2..],
            remaining: self.count,
            last_time: 0,
            first: true,
        })
    }

    fn type_tag(&self) -> u8 {
        DELTA_CHUNK_TYPE
    }
}

struct DeltaChunkIter<'a> {
    cursor: &'a [u8],
    remaining: usize,
    last_time: i64,
    first: bool,
}

impl Iterator for DeltaChunkIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.remaining == 0 {
            return None;
        }
        let timestamp = if self.first {
            self.first = false;
            let mut ts = [0u8; 8];
            self.cursor.read_exact(&mut ts).ok()?;
            i64::from_le_bytes(ts)
        } else {
            let dt = read_uvarint(&mut self.cursor).ok()?;
            self.last_time + dt as i64
        };
        let mut value = [0u8; 8];
        self.cursor.read_exact(&mut value).ok()?;
        self.last_time = timestamp;
        self.remaining -= 1;
        Some(Sample::new(timestamp, f64::from_le_bytes(value)))
    }
}
