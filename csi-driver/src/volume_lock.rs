//! Per-volume lock registry.
//!
//! CSI requires at most one in-flight lifecycle operation per volume.
//! `VolumeLocks` hands out an async mutex per volume handle: concurrent
//! calls for the same handle serialize, distinct handles proceed in
//! parallel. Entries are reference-counted and reaped after an idle period
//! so the map does not grow with the lifetime of the cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// How long an unreferenced entry may linger before it is reaped.
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

struct Entry {
    lock: Arc<Mutex<()>>,
    refs: usize,
    last_used: Instant,
}

struct Inner {
    map: StdMutex<HashMap<String, Entry>>,
    idle_ttl: Duration,
}

/// Registry of per-volume locks.
#[derive(Clone)]
pub struct VolumeLocks {
    inner: Arc<Inner>,
}

impl Default for VolumeLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                map: StdMutex::new(HashMap::new()),
                idle_ttl,
            }),
        }
    }

    /// Acquire the lock for a volume handle, creating the entry on demand.
    ///
    /// The returned guard releases the lock on drop.
    pub async fn lock(&self, key: &str) -> VolumeLockGuard {
        let lock = {
            let mut map = self
                .inner
                .map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let idle_ttl = self.inner.idle_ttl;
            map.retain(|_, e| e.refs > 0 || e.last_used.elapsed() < idle_ttl);

            let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                refs: 0,
                last_used: Instant::now(),
            });
            entry.refs += 1;
            entry.lock.clone()
        };

        let guard = lock.lock_owned().await;
        VolumeLockGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Number of live entries (for tests and debugging).
    pub fn len(&self) -> usize {
        self.inner
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard holding the per-volume lock. Dropping it releases the lock and
/// marks the entry idle.
pub struct VolumeLockGuard {
    inner: Arc<Inner>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        let mut map = self
            .inner
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&self.key) {
            entry.refs = entry.refs.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}
