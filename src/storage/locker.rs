//! Per-fingerprint locking
//!
//! [`FingerprintLocker`] hands out mutual exclusion per fingerprint while
//! only keeping memory for fingerprints that currently have a holder or a
//! waiter. Lock objects are recycled through a bounded pool; anything beyond
//! the pool capacity is simply dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::storage::model::Fingerprint;

struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    ref_count: usize,
}

struct LockerInner {
    locks: HashMap<Fingerprint, LockEntry>,
    pool: Vec<Arc<AsyncMutex<()>>>,
    pool_cap: usize,
}

impl LockerInner {
    fn take_from_pool(&mut self) -> Arc<AsyncMutex<()>> {
        self.pool.pop().unwrap_or_else(|| Arc::new(AsyncMutex::new(())))
    }

    fn return_to_pool(&mut self, mutex: Arc<AsyncMutex<()>>) {
        if self.pool.len() < self.pool_cap {
            self.pool.push(mutex);
        }
    }
}

/// Locks individual fingerprints such that a lock only exists (and uses
/// memory) while it is held or waited on by at least one task.
pub struct FingerprintLocker {
    inner: Mutex<LockerInner>,
}

impl FingerprintLocker {
    /// Creates a locker with `preallocated_mutexes` lock objects pooled up
    /// front. The pool never grows beyond that size.
    pub fn new(preallocated_mutexes: usize) -> Self {
        let pool = (0..preallocated_mutexes)
            .map(|_| Arc::new(AsyncMutex::new(())))
            .collect();
        Self {
            inner: Mutex::new(LockerInner {
                locks: HashMap::new(),
                pool,
                pool_cap: preallocated_mutexes,
            }),
        }
    }

    /// Locks the given fingerprint. The returned guard releases the lock on
    /// drop. Blocking happens outside the locker's own mutex, so contention
    /// on one fingerprint never stalls others.
    pub async fn lock(&self, fp: Fingerprint) -> FingerprintGuard<'_> {
        let mutex = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.locks.get_mut(&fp) {
                entry.ref_count += 1;
                entry.mutex.clone()
            } else {
                let mutex = inner.take_from_pool();
                inner.locks.insert(
                    fp,
                    LockEntry {
                        mutex: mutex.clone(),
                        ref_count: 1,
                    },
                );
                mutex
            }
        };

        let guard = mutex.lock_owned().await;
        FingerprintGuard {
            locker: self,
            fp,
            guard: Some(guard),
        }
    }
}

/// Holds one fingerprint's lock until dropped.
pub struct FingerprintGuard<'a> {
    locker: &'a FingerprintLocker,
    fp: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FingerprintGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.locker.inner.lock().unwrap();
        drop(self.guard.take());

        let entry = inner
            .locks
            .get_mut(&self.fp)
            .expect("guard dropped for untracked fingerprint");
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let entry = inner.locks.remove(&self.fp).unwrap();
            inner.return_to_pool(entry.mutex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_lock_is_exclusive_per_fingerprint() {
        let locker = Arc::new(FingerprintLocker::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint(0x17);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locker = Arc::clone(&locker);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let _guard = locker.lock(fp).await;
                    let v = counter.load(Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    counter.store(v + 1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }

    #[tokio::test]
    async fn test_different_fingerprints_do_not_block() {
        let locker = FingerprintLocker::new(2);
        let a = locker.lock(Fingerprint(1)).await;
        // Would deadlock if fingerprints shared a lock.
        let b = locker.lock(Fingerprint(2)).await;
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_entries_are_released_when_idle() {
        let locker = FingerprintLocker::new(2);
        for i in 0..32 {
            let guard = locker.lock(Fingerprint(i)).await;
            drop(guard);
        }
        let inner = locker.inner.lock().unwrap();
        assert!(inner.locks.is_empty());
        assert!(inner.pool.len() <= 2);
    }
}
