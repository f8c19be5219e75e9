//! Secondary indexes backed by persistent key-value stores
//!
//! Four indexes keep labels resolvable without the series files:
//!
//! - **FingerprintMetricIndex**: archived fingerprint → metric
//! - **FingerprintTimeRangeIndex**: archived fingerprint → (first, last)
//! - **LabelNameLabelValuesIndex**: label name → set of label values
//! - **LabelPairFingerprintsIndex**: label pair → set of fingerprints
//!
//! The first two only hold archived series; the label indexes cover live and
//! archived series alike. Batches commit atomically; a mapping to an empty
//! set deletes its key. Looking up a missing key is never an error.

mod kv;
mod sqlite;

pub use kv::{Batch, BatchOp, KeyValueStore};
pub use sqlite::SqliteStore;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::storage::codec;
use crate::storage::error::StorageResult;
use crate::storage::model::{Fingerprint, LabelName, LabelPair, LabelValue, Metric, TimeRange};

const FINGERPRINT_TO_METRIC_DIR: &str = "archived_fingerprint_to_metric";
const FINGERPRINT_TIME_RANGE_DIR: &str = "archived_fingerprint_to_timerange";
const LABEL_NAME_TO_LABEL_VALUES_DIR: &str = "labelname_to_labelvalues";
const LABEL_PAIR_TO_FINGERPRINTS_DIR: &str = "labelpair_to_fingerprints";

/// In-memory accumulator mapping fingerprints to metrics.
pub type FingerprintMetricMapping = HashMap<Fingerprint, Metric>;

/// In-memory accumulator mapping label names to their value sets.
pub type LabelNameLabelValuesMapping = HashMap<LabelName, HashSet<LabelValue>>;

/// In-memory accumulator mapping label pairs to their fingerprint sets.
pub type LabelPairFingerprintsMapping = HashMap<LabelPair, HashSet<Fingerprint>>;

/// Maps archived fingerprints to their metrics.
pub struct FingerprintMetricIndex {
    store: Box<dyn KeyValueStore>,
}

impl FingerprintMetricIndex {
    pub fn open(base_path: &Path, cache_size_bytes: usize) -> StorageResult<Self> {
        let store = SqliteStore::open(&base_path.join(FINGERPRINT_TO_METRIC_DIR), cache_size_bytes)?;
        Ok(Self {
            store: Box::new(store),
        })
    }

    pub fn put(&self, fp: Fingerprint, metric: &Metric) -> StorageResult<()> {
        let mut value = Vec::new();
        codec::write_metric(&mut value, metric)?;
        self.store.put(&codec::fingerprint_key(fp), &value)
    }

    pub fn delete(&self, fp: Fingerprint) -> StorageResult<()> {
        self.store.delete(&codec::fingerprint_key(fp))
    }

    /// Looks up the metric for a fingerprint; missing is `Ok(None)`.
    pub fn lookup(&self, fp: Fingerprint) -> StorageResult<Option<Metric>> {
        match self.store.get(&codec::fingerprint_key(fp))? {
            Some(bytes) => Ok(Some(codec::read_metric(&mut bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn index_batch(&self, mapping: &FingerprintMetricMapping) -> StorageResult<()> {
        let mut batch = Batch::new();
        for (fp, metric) in mapping {
            let mut value = Vec::new();
            codec::write_metric(&mut value, metric)?;
            batch.put(codec::fingerprint_key(*fp).to_vec(), value);
        }
        self.store.commit(batch)
    }

    pub fn unindex_batch(&self, mapping: &FingerprintMetricMapping) -> StorageResult<()> {
        let mut batch = Batch::new();
        for fp in mapping.keys() {
            batch.delete(codec::fingerprint_key(*fp).to_vec());
        }
        self.store.commit(batch)
    }

    pub fn close(&self) -> StorageResult<()> {
        self.store.close()
    }
}

/// Tracks the (first, last) sample time range of archived fingerprints.
pub struct FingerprintTimeRangeIndex {
    store: Box<dyn KeyValueStore>,
}

impl FingerprintTimeRangeIndex {
    pub fn open(base_path: &Path, cache_size_bytes: usize) -> StorageResult<Self> {
        let store =
            SqliteStore::open(&base_path.join(FINGERPRINT_TIME_RANGE_DIR), cache_size_bytes)?;
        Ok(Self {
            store: Box::new(store),
        })
    }

    pub fn put(&self, fp: Fingerprint, range: TimeRange) -> StorageResult<()> {
        self.store
            .put(&codec::fingerprint_key(fp), &codec::encode_time_range(range)?)
    }

    pub fn delete(&self, fp: Fingerprint) -> StorageResult<()> {
        self.store.delete(&codec::fingerprint_key(fp))
    }

    /// Looks up the time range for a fingerprint; missing is `Ok(None)`.
    pub fn lookup(&self, fp: Fingerprint) -> StorageResult<Option<TimeRange>> {
        match self.store.get(&codec::fingerprint_key(fp))? {
            Some(bytes) => Ok(Some(codec::decode_time_range(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, fp: Fingerprint) -> StorageResult<bool> {
        Ok(self.store.get(&codec::fingerprint_key(fp))?.is_some())
    }

    /// Calls `f` with every (fingerprint, time range) entry in key order.
    pub fn for_each(
        &self,
        f: &mut dyn FnMut(Fingerprint, TimeRange) -> StorageResult<()>,
    ) -> StorageResult<()> {
        self.store.for_each(&mut |key, value| {
            let fp = codec::fingerprint_from_key(key)?;
            let range = codec::decode_time_range(value)?;
            f(fp, range)
        })
    }

    pub fn close(&self) -> StorageResult<()> {
        self.store.close()
    }
}

/// Maps label names to the set of label values in use for them.
pub struct LabelNameLabelValuesIndex {
    store: Box<dyn KeyValueStore>,
}

impl LabelNameLabelValuesIndex {
    pub fn open(base_path: &Path, cache_size_bytes: usize) -> StorageResult<Self> {
        let store = SqliteStore::open(
            &base_path.join(LABEL_NAME_TO_LABEL_VALUES_DIR),
            cache_size_bytes,
        )?;
        Ok(Self {
            store: Box::new(store),
        })
    }

    /// Commits a batch of name → value-set mappings. An empty value set
    /// deletes the name from the index.
    pub fn index_batch(&self, mapping: &LabelNameLabelValuesMapping) -> StorageResult<()> {
        let mut batch = Batch::new();
        for (name, values) in mapping {
            let key = codec::label_name_key(name)?;
            if values.is_empty() {
                batch.delete(key);
            } else {
                batch.put(key, codec::encode_label_value_set(values)?);
            }
        }
        self.store.commit(batch)
    }

    /// Looks up all values for a name; missing is `Ok(None)`.
    pub fn lookup(&self, name: &str) -> StorageResult<Option<Vec<LabelValue>>> {
        match self.store.get(&codec::label_name_key(name)?)? {
            Some(bytes) => {
                let set = codec::decode_label_value_set(&bytes)?;
                let mut values: Vec<LabelValue> = set.into_iter().collect();
                values.sort();
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    /// Like `lookup` but returns a membership set; a missing name yields an
    /// empty set, which is what batch accumulation wants to seed with.
    pub fn lookup_set(&self, name: &str) -> StorageResult<HashSet<LabelValue>> {
        match self.store.get(&codec::label_name_key(name)?)? {
            Some(bytes) => codec::decode_label_value_set(&bytes),
            None => Ok(HashSet::new()),
        }
    }

    pub fn close(&self) -> StorageResult<()> {
        self.store.close()
    }
}

/// Maps label pairs to the set of fingerprints carrying them.
pub struct LabelPairFingerprintsIndex {
    store: Box<dyn KeyValueStore>,
}

impl LabelPairFingerprintsIndex {
    pub fn open(base_path: &Path, cache_size_bytes: usize) -> StorageResult<Self> {
        let store = SqliteStore::open(
            &base_path.join(LABEL_PAIR_TO_FINGERPRINTS_DIR),
            cache_size_bytes,
        )?;
        Ok(Self {
            store: Box::new(store),
        })
    }

    /// Commits a batch of pair → fingerprint-set mappings. An empty set
    /// deletes the pair from the index.
    pub fn index_batch(&self, mapping: &LabelPairFingerprintsMapping) -> StorageResult<()> {
        let mut batch = Batch::new();
        for (pair, fps) in mapping {
            let key = codec::label_pair_key(pair)?;
            if fps.is_empty() {
                batch.delete(key);
            } else {
                batch.put(key, codec::encode_fingerprint_set(fps)?);
            }
        }
        self.store.commit(batch)
    }

    /// Looks up all fingerprints for a pair; missing is `Ok(None)`.
    pub fn lookup(&self, pair: &LabelPair) -> StorageResult<Option<Vec<Fingerprint>>> {
        match self.store.get(&codec::label_pair_key(pair)?)? {
            Some(bytes) => {
                let set = codec::decode_fingerprint_set(&bytes)?;
                let mut fps: Vec<Fingerprint> = set.into_iter().collect();
                fps.sort();
                Ok(Some(fps))
            }
            None => Ok(None),
        }
    }

    /// Like `lookup` but returns a membership set; missing yields empty.
    pub fn lookup_set(&self, pair: &LabelPair) -> StorageResult<HashSet<Fingerprint>> {
        match self.store.get(&codec::label_pair_key(pair)?)? {
            Some(bytes) => codec::decode_fingerprint_set(&bytes),
            None => Ok(HashSet::new()),
        }
    }

    pub fn close(&self) -> StorageResult<()> {
        self.store.close()
    }
}
