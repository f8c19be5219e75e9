//! Core data types for the Vigil persistence layer
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Fingerprint`: stable 64-bit identifier of a time series
//! - `Metric`: a labeled time-series identity (label name → label value)
//! - `LabelPair`: a single (name, value) pair
//! - `Sample`: one (timestamp, value) measurement
//! - `TimeRange`: first and last sample timestamps of a series

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A label name. Must match `[A-Za-z_][A-Za-z0-9_]*`.
pub type LabelName = String;

/// A label value. Arbitrary UTF-8.
pub type LabelValue = String;

/// Stable 64-bit identifier of a time series, derived from its label set.
///
/// Formatted as a zero-padded 16-character lowercase hex string. The first
/// two hex characters select the shard directory of the series file, the
/// remaining fourteen form the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// The shard directory component (first two hex characters).
    pub fn dir_part(&self) -> String {
        format!("{:02x}", self.0 >> 56)
    }

    /// The file name component (remaining fourteen hex characters).
    pub fn file_part(&self) -> String {
        format!("{:014x}", self.0 & 0x00ff_ffff_ffff_ffff)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Fingerprint)
    }
}

impl From<u64> for Fingerprint {
    fn from(v: u64) -> Self {
        Fingerprint(v)
    }
}

/// A single (label name, label value) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelPair {
    pub name: LabelName,
    pub value: LabelValue,
}

impl LabelPair {
    pub fn new(name: impl Into<LabelName>, value: impl Into<LabelValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for LabelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// A labeled time-series identity: a mapping of label name to label value.
///
/// Keys are unique and order is irrelevant; the canonical serialization
/// sorts pairs by name so equal metrics produce equal bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metric(HashMap<LabelName, LabelValue>);

impl Metric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a metric from (name, value) string pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn insert(&mut self, name: impl Into<LabelName>, value: impl Into<LabelValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&LabelValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LabelName, &LabelValue)> {
        self.0.iter()
    }

    /// Label pairs sorted lexicographically by name, for stable bytes.
    pub fn sorted_pairs(&self) -> Vec<(&LabelName, &LabelValue)> {
        let mut pairs: Vec<_> = self.0.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.sorted_pairs().into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(LabelName, LabelValue)> for Metric {
    fn from_iter<T: IntoIterator<Item = (LabelName, LabelValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single time-series measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// The measured value
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// The first and last sample timestamps of a series, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub first: i64,
    pub last: i64,
}

impl TimeRange {
    pub fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_formatting() {
        let fp = Fingerprint(0xdead_0000_0000_0000);
        assert_eq!(fp.to_string(), "dead000000000000");
        assert_eq!(fp.dir_part(), "de");
        assert_eq!(fp.file_part(), "ad000000000000");

        let fp = Fingerprint(0xdead);
        assert_eq!(fp.to_string(), "000000000000dead");
        assert_eq!(fp.dir_part(), "00");
        assert_eq!(fp.file_part(), "0000000000dead");
    }

    #[test]
    fn test_fingerprint_parse_roundtrip() {
        let fp = Fingerprint(0x0123_4567_89ab_cdef);
        let parsed: Fingerprint = fp.to_string().parse().unwrap();
        assert_eq!(parsed, fp);

        assert!("not hex!".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_metric_sorted_pairs() {
        let m = Metric::from_pairs(&[("job", "api"), ("env", "prod"), ("instance", "a")]);
        let names: Vec<&str> = m.sorted_pairs().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["env", "instance", "job"]);
    }

    #[test]
    fn test_metric_equality_ignores_order() {
        let a = Metric::from_pairs(&[("a", "1"), ("b", "2")]);
        let b = Metric::from_pairs(&[("b", "2"), ("a", "1")]);
        assert_eq!(a, b);
    }
}
