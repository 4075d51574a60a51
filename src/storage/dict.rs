//! Sharded Concurrent Dictionary
//!
//! A hash table split into a power-of-two number of shards, each guarded
//! by its own `RwLock`. A key's shard is `fnv32(key) & (shards - 1)`.
//!
//! Every method holds exactly one shard lock for the duration of one
//! operation. [`Dict::for_each`] visits shards one at a time, so a walk
//! over the whole table is not an atomic snapshot: keys written while the
//! walk is in progress may or may not be seen.

use super::{compute_capacity, fnv32};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Dict<V> {
    shards: Vec<RwLock<HashMap<Bytes, V>>>,
    count: AtomicUsize,
}

impl<V> std::fmt::Debug for Dict<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dict")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

impl<V> Dict<V> {
    /// Creates a dictionary with at least `shard_count` shards.
    pub fn new(shard_count: usize) -> Self {
        let n = compute_capacity(shard_count);
        let shards = (0..n).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Bytes, V>> {
        let index = fnv32(key) as usize & (self.shards.len() - 1);
        &self.shards[index]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Runs `f` against the value under a shared shard lock.
    pub fn with<R>(&self, key: &[u8], f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).read().get(key).map(f)
    }

    /// Runs `f` against the value under an exclusive shard lock.
    pub fn with_mut<R>(&self, key: &[u8], f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).write().get_mut(key).map(f)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Inserts or replaces. Returns 1 for a new key, 0 for an update.
    pub fn put(&self, key: Bytes, value: V) -> usize {
        let mut shard = self.shard(&key).write();
        if shard.insert(key, value).is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        } else {
            0
        }
    }

    /// Inserts only if the key is absent. Returns 1 if inserted.
    pub fn put_if_absent(&self, key: Bytes, value: V) -> usize {
        let mut shard = self.shard(&key).write();
        if shard.contains_key(&key) {
            return 0;
        }
        shard.insert(key, value);
        self.count.fetch_add(1, Ordering::Relaxed);
        1
    }

    /// Replaces only if the key is present. Returns 1 if replaced.
    pub fn put_if_exists(&self, key: Bytes, value: V) -> usize {
        let mut shard = self.shard(&key).write();
        match shard.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Atomically computes a new value from the current one and stores it.
    pub fn upsert(&self, key: Bytes, f: impl FnOnce(Option<&V>) -> V) -> usize {
        let mut shard = self.shard(&key).write();
        let next = f(shard.get(&key));
        if shard.insert(key, next).is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        } else {
            0
        }
    }

    pub fn remove(&self, key: &[u8]) -> Option<V> {
        let removed = self.shard(key).write().remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry, one shard at a time. Stops as soon as `visit`
    /// returns `false`.
    pub fn for_each(&self, mut visit: impl FnMut(&Bytes, &V) -> bool) {
        for shard in &self.shards {
            let shard = shard.read();
            for (key, value) in shard.iter() {
                if !visit(key, value) {
                    return;
                }
            }
        }
    }

    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.write();
            self.count.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }
}

impl<V: Clone> Dict<V> {
    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }
}
