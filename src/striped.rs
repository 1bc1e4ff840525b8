//! Lock-striped map keyed by peer id.
//!
//! Concurrent match tasks update different peers without contending on one global lock:
//! each key lives in exactly one shard and every mutation of that key goes through the
//! shard's mutex. Guards are never held across an `.await`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) const DEFAULT_STRIPES: usize = 16;

pub(crate) struct Striped<V> {
    shards: Box<[Mutex<HashMap<String, V>>]>,
}

impl<V> Striped<V> {
    pub(crate) fn new(stripes: usize) -> Self {
        let shards = (0..stripes.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the value for `key`, if any.
    pub(crate) fn with<R>(&self, key: &str, f: impl FnOnce(Option<&mut V>) -> R) -> R {
        let mut shard = self.shard(key);
        f(shard.get_mut(key))
    }

    /// Run `f` on the value for `key`, inserting `default()` first if missing.
    pub(crate) fn upsert<R>(
        &self,
        key: &str,
        default: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut shard = self.shard(key);
        let value = shard.entry(key.to_string()).or_insert_with(default);
        f(value)
    }

    pub(crate) fn insert(&self, key: String, value: V) -> Option<V> {
        self.shard(&key).insert(key, value)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.shard(key).contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

impl<V: Clone> Striped<V> {
    pub(crate) fn get(&self, key: &str) -> Option<V> {
        self.shard(key).get(key).cloned()
    }

    /// Snapshot of every value. Shards are visited one at a time, so the result is
    /// per-key consistent only.
    pub(crate) fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            out.extend(guard.values().cloned());
        }
        out
    }
}

impl<V> Default for Striped<V> {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
