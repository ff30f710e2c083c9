// 14.0 locks.rs: one mutex per key, created on first use.
// balances serialize per agent and positions per position id; unrelated keys never contend.
// 14.1 two-key sections take both locks in sorted key order so no pair of callers can deadlock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Ord,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        // clone the Arc out so the shard guard is released before we block on the mutex
        if let Some(existing) = self.locks.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let handle = self.handle(key);
        let _guard = handle.lock();
        f()
    }

    /// Run `f` while holding the locks for both keys, acquired in sorted order.
    /// Equal keys take a single lock.
    pub fn with_pair<R>(&self, a: &K, b: &K, f: impl FnOnce() -> R) -> R {
        if a == b {
            return self.with_lock(a, f);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.handle(first);
        let second = self.handle(second);
        let _g1 = first.lock();
        let _g2 = second.lock();
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("keys", &self.locks.len())
            .finish()
    }
}
