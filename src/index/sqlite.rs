//! SQLite-backed key-value store
//!
//! Each index gets its own database directory with a single `kv` table whose
//! BLOB primary key doubles as the iteration order, so lexicographic key
//! order is the table order. Batches are SQLite transactions, which gives
//! the atomic-commit guarantee the indexes rely on.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};

use crate::index::kv::{Batch, BatchOp, KeyValueStore};
use crate::storage::error::StorageResult;
use crate::storage::fsutil;

/// A `KeyValueStore` on a single SQLite database.
///
/// The connection is shared behind a `Mutex` because SQLite connections are
/// not `Sync`; all operations are short and never hold the lock across an
/// await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Opens (or creates) the store in the given directory.
    /// `cache_size_bytes` bounds SQLite's page cache for this database.
    pub fn open(dir: &Path, cache_size_bytes: usize) -> StorageResult<Self> {
        fsutil::ensure_dir(dir)?;
        let path = dir.join("index.db");

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // Negative cache_size is interpreted as KiB.
        let cache_kib = (cache_size_bytes / 1024).max(1) as i64;
        conn.execute_batch(&format!(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -{};
            PRAGMA temp_store = MEMORY;
            ",
            cache_kib
        ))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                k BLOB PRIMARY KEY,
                v BLOB NOT NULL
            ) WITHOUT ROWID",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT v FROM kv WHERE k = ?")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("INSERT OR REPLACE INTO kv (k, v) VALUES (?, ?)")?
            .execute(params![key, value])?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM kv WHERE k = ?")?
            .execute(params![key])?;
        Ok(())
    }

    fn commit(&self, batch: Batch) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut put = tx.prepare_cached("INSERT OR REPLACE INTO kv (k, v) VALUES (?, ?)")?;
            let mut del = tx.prepare_cached("DELETE FROM kv WHERE k = ?")?;
            for op in &batch.ops {
                match op {
                    BatchOp::Put { key, value } => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete { key } => {
                        del.execute(params![key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> StorageResult<()>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT k, v FROM kv ORDER BY k")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            f(&key, &value)?;
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_point_operations() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path(), 1024 * 1024).unwrap();

        assert_eq!(store.get(b"missing").unwrap(), None);

        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.put(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_batch_commit_is_atomic_unit() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path(), 1024 * 1024).unwrap();

        store.put(b"gone", b"x").unwrap();

        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"gone".to_vec());
        store.commit(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_for_each_in_key_order() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path(), 1024 * 1024).unwrap();

        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"c", b"3").unwrap();

        let mut keys = Vec::new();
        store
            .for_each(&mut |k, _| {
                keys.push(k.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_persistence_across_opens() {
        let dir = tempdir().unwrap();
        {
            let store = SqliteStore::open(dir.path(), 1024 * 1024).unwrap();
            store.put(b"k", b"v").unwrap();
            store.close().unwrap();
        }
        {
            let store = SqliteStore::open(dir.path(), 1024 * 1024).unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        }
    }
}
