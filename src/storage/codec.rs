//! Bit-exact binary encoders and decoders
//!
//! Everything the on-disk formats share lives here: varints, fixed-width
//! 64-bit integers, and the serializations of fingerprints, label names and
//! values, label pairs, metrics, value/fingerprint sets, and time ranges.
//! Index keys and values are produced by these functions and handed to the
//! key-value store as opaque bytes.
//!
//! Conventions:
//! - Fixed-width integers in chunk files and the heads checkpoint are
//!   little-endian.
//! - Fingerprints used as index keys are big-endian so that lexicographic
//!   key order matches numeric order.
//! - Signed integers use zigzag varint encoding; lengths and counts use
//!   plain unsigned varints.
//! - Sets and metrics are written in sorted order for stable bytes.

use std::collections::HashSet;
use std::io::{Read, Write};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::model::{Fingerprint, LabelPair, LabelValue, Metric, TimeRange};

const MAX_VARINT_LEN: usize = 10;

/// Writes an unsigned varint, returning the number of bytes written.
pub fn write_uvarint<W: Write + ?Sized>(w: &mut W, mut v: u64) -> StorageResult<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut n = 0;
    while v >= 0x80 {
        buf[n] = (v as u8) | 0x80;
        v >>= 7;
        n += 1;
    }
    buf[n] = v as u8;
    n += 1;
    w.write_all(&buf[..n])?;
    Ok(n)
}

/// Reads an unsigned varint.
pub fn read_uvarint<R: Read + ?Sized>(r: &mut R) -> StorageResult<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte)?;
        if shift == 63 && byte[0] > 1 {
            return Err(StorageError::Corruption("varint overflows 64 bits".into()));
        }
        v |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] < 0x80 {
            return Ok(v);
        }
        shift += 7;
    }
}

/// Writes a signed varint (zigzag), returning the number of bytes written.
pub fn write_varint<W: Write + ?Sized>(w: &mut W, v: i64) -> StorageResult<usize> {
    write_uvarint(w, ((v << 1) ^ (v >> 63)) as u64)
}

/// Reads a signed varint (zigzag).
pub fn read_varint<R: Read + ?Sized>(r: &mut R) -> StorageResult<i64> {
    let zz = read_uvarint(r)?;
    Ok(((zz >> 1) as i64) ^ -((zz & 1) as i64))
}

/// Writes a fixed-width little-endian u64.
pub fn write_u64_le<W: Write + ?Sized>(w: &mut W, v: u64) -> StorageResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Reads a fixed-width little-endian u64.
pub fn read_u64_le<R: Read + ?Sized>(r: &mut R) -> StorageResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> StorageResult<()> {
    write_uvarint(w, s.len() as u64)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string<R: Read + ?Sized>(r: &mut R) -> StorageResult<String> {
    let len = read_uvarint(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| StorageError::Corruption(format!("invalid UTF-8: {}", e)))
}

/// The 8-byte big-endian index key of a fingerprint.
pub fn fingerprint_key(fp: Fingerprint) -> [u8; 8] {
    fp.0.to_be_bytes()
}

/// Decodes a fingerprint from an 8-byte big-endian index key.
pub fn fingerprint_from_key(key: &[u8]) -> StorageResult<Fingerprint> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Corruption(format!("fingerprint key has {} bytes", key.len())))?;
    Ok(Fingerprint(u64::from_be_bytes(bytes)))
}

/// Encodes a label pair: length-prefixed name, then length-prefixed value.
pub fn label_pair_key(pair: &LabelPair) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(pair.name.len() + pair.value.len() + 4);
    write_string(&mut buf, &pair.name)?;
    write_string(&mut buf, &pair.value)?;
    Ok(buf)
}

/// Encodes a label name as an index key.
pub fn label_name_key(name: &str) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(name.len() + 2);
    write_string(&mut buf, name)?;
    Ok(buf)
}

/// Writes a metric canonically: a count, then (name, value) pairs sorted
/// lexicographically by name.
pub fn write_metric<W: Write + ?Sized>(w: &mut W, m: &Metric) -> StorageResult<()> {
    write_uvarint(w, m.len() as u64)?;
    for (name, value) in m.sorted_pairs() {
        write_string(w, name)?;
        write_string(w, value)?;
    }
    Ok(())
}

/// Reads a canonically serialized metric.
pub fn read_metric<R: Read + ?Sized>(r: &mut R) -> StorageResult<Metric> {
    let count = read_uvarint(r)?;
    let mut m = Metric::new();
    for _ in 0..count {
        let name = read_string(r)?;
        let value = read_string(r)?;
        m.insert(name, value);
    }
    Ok(m)
}

/// Encodes a set of label values: a count, then each value, sorted.
pub fn encode_label_value_set(values: &HashSet<LabelValue>) -> StorageResult<Vec<u8>> {
    let mut sorted: Vec<&LabelValue> = values.iter().collect();
    sorted.sort();
    let mut buf = Vec::new();
    write_uvarint(&mut buf, sorted.len() as u64)?;
    for v in sorted {
        write_string(&mut buf, v)?;
    }
    Ok(buf)
}

/// Decodes a set of label values.
pub fn decode_label_value_set(bytes: &[u8]) -> StorageResult<HashSet<LabelValue>> {
    let mut r = bytes;
    let count = read_uvarint(&mut r)?;
    let mut set = HashSet::with_capacity(count as usize);
    for _ in 0..count {
        set.insert(read_string(&mut r)?);
    }
    Ok(set)
}

/// Encodes a set of fingerprints: a count, then each fingerprint as its
/// 8-byte big-endian form, sorted.
pub fn encode_fingerprint_set(fps: &HashSet<Fingerprint>) -> StorageResult<Vec<u8>> {
    let mut sorted: Vec<Fingerprint> = fps.iter().copied().collect();
    sorted.sort();
    let mut buf = Vec::with_capacity(2 + sorted.len() * 8);
    write_uvarint(&mut buf, sorted.len() as u64)?;
    for fp in sorted {
        buf.extend_from_slice(&fingerprint_key(fp));
    }
    Ok(buf)
}

/// Decodes a set of fingerprints.
pub fn decode_fingerprint_set(bytes: &[u8]) -> StorageResult<HashSet<Fingerprint>> {
    let mut r = bytes;
    let count = read_uvarint(&mut r)?;
    let mut set = HashSet::with_capacity(count as usize);
    for _ in 0..count {
        let mut key = [0u8; 8];
        r.read_exact(&mut key)
            .map_err(|_| StorageError::Corruption("truncated fingerprint set".into()))?;
        set.insert(Fingerprint(u64::from_be_bytes(key)));
    }
    Ok(set)
}

/// Encodes a time range as two signed varints (first, last).
pub fn encode_time_range(tr: TimeRange) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 * MAX_VARINT_LEN);
    write_varint(&mut buf, tr.first)?;
    write_varint(&mut buf, tr.last)?;
    Ok(buf)
}

/// Decodes a time range.
pub fn decode_time_range(bytes: &[u8]) -> StorageResult<TimeRange> {
    let mut r = bytes;
    let first = read_varint(&mut r)?;
    let last = read_varint(&mut r)?;
    Ok(TimeRange { first, last })
}
