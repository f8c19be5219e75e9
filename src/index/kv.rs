//! Key-value store contract
//!
//! The indexes only need an ordered persistent key-value store with point
//! operations, atomic batch commits, and forward iteration. [`SqliteStore`]
//! is the implementation shipped with this crate, but anything honoring this
//! trait can back an index.
//!
//! [`SqliteStore`]: super::SqliteStore

use crate::storage::error::StorageResult;

/// One operation in a batch.
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A set of put/delete operations committed atomically.
#[derive(Default)]
pub struct Batch {
    pub(crate) ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An ordered persistent key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Point lookup. A missing key is not an error.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Applies all operations in the batch atomically.
    fn commit(&self, batch: Batch) -> StorageResult<()>;

    /// Calls `f` for every entry in key order, stopping at the first error.
    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> StorageResult<()>) -> StorageResult<()>;

    /// Flushes buffered state and releases resources.
    fn close(&self) -> StorageResult<()>;
}
