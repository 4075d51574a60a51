//! Striped Key Locks
//!
//! A fixed table of read-write locks. Every key maps to one slot through
//! the same hash the [`Dict`](super::Dict) uses; distinct keys may share a
//! slot.
//!
//! Multi-key locking always goes through [`LockTable::lock_read_write`]:
//! slot indices are deduplicated and acquired in ascending order, then
//! released in descending order when the returned [`BatchGuard`] drops.
//! Because every caller agrees on that order no two batches can wait on
//! each other in a cycle, whatever order the keys were supplied in.
//!
//! A slot named by at least one write key is taken exclusively even if a
//! read key maps to it too.

use super::{compute_capacity, fnv32};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;

pub struct LockTable {
    slots: Vec<RwLock<()>>,
}

// Held only to keep the slot locked.
#[allow(dead_code)]
enum SlotGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

/// Locks held for one operation. Dropping it releases every slot, highest
/// index first.
#[must_use = "the slots are released as soon as the guard is dropped"]
pub struct BatchGuard<'a> {
    guards: Vec<SlotGuard<'a>>,
}

impl BatchGuard<'_> {
    pub fn slots(&self) -> usize {
        self.guards.len()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl LockTable {
    pub fn new(size: usize) -> Self {
        let n = compute_capacity(size);
        Self {
            slots: (0..n).map(|_| RwLock::new(())).collect(),
        }
    }

    #[inline]
    pub fn slot_of(&self, key: &[u8]) -> usize {
        fnv32(key) as usize & (self.slots.len() - 1)
    }

    /// Exclusive lock on one key.
    pub fn lock(&self, key: &[u8]) -> BatchGuard<'_> {
        self.lock_read_write(&[key], &[] as &[&[u8]])
    }

    /// Shared lock on one key.
    pub fn rlock(&self, key: &[u8]) -> BatchGuard<'_> {
        self.lock_read_write(&[] as &[&[u8]], &[key])
    }

    /// Exclusive lock on every key.
    pub fn lock_many<K: AsRef<[u8]>>(&self, keys: &[K]) -> BatchGuard<'_> {
        self.lock_read_write(keys, &[] as &[&[u8]])
    }

    /// Slot indices a batch would acquire, in acquisition order, paired with
    /// whether each is taken exclusively.
    pub fn plan<W, R>(&self, write_keys: &[W], read_keys: &[R]) -> Vec<(usize, bool)>
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        let mut plan: BTreeMap<usize, bool> = BTreeMap::new();
        for key in read_keys {
            plan.entry(self.slot_of(key.as_ref())).or_insert(false);
        }
        for key in write_keys {
            plan.insert(self.slot_of(key.as_ref()), true);
        }
        plan.into_iter().collect()
    }

    /// Locks write keys exclusively and read keys shared, in ascending slot
    /// order.
    pub fn lock_read_write<W, R>(&self, write_keys: &[W], read_keys: &[R]) -> BatchGuard<'_>
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        let guards = self
            .plan(write_keys, read_keys)
            .into_iter()
            .map(|(slot, exclusive)| {
                let lock = &self.slots[slot];
                if exclusive {
                    SlotGuard::Write(lock.write())
                } else {
                    SlotGuard::Read(lock.read())
                }
            })
            .collect();
        BatchGuard { guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_plan_is_sorted_and_deduplicated() {
        let table = LockTable::new(1024);
        let keys = ["k3", "k1", "k2", "k1"];
        let plan = table.plan(&keys, &[] as &[&str]);
        let slots: Vec<usize> = plan.iter().map(|(s, _)| *s).collect();
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(slots, sorted);

        let reversed = ["k1", "k2", "k3"];
        assert_eq!(table.plan(&reversed, &[] as &[&str]), plan);
    }

    #[test]
    fn test_write_intent_dominates() {
        let table = LockTable::new(16);
        let plan = table.plan(&["a"], &["a", "b"]);
        let slot_a = table.slot_of(b"a");
        assert!(plan.contains(&(slot_a, true)));
        assert!(!plan.contains(&(slot_a, false)));
    }

    #[test]
    fn test_readers_share_slot() {
        let table = LockTable::new(16);
        let first = table.rlock(b"key");
        let second = table.rlock(b"key");
        assert_eq!(first.slots() + second.slots(), 2);
    }

    #[test]
    fn test_writer_excludes_others() {
        let table = Arc::new(LockTable::new(16));
        let guard = table.lock(b"key");

        let (tx, rx) = mpsc::channel();
        let t = Arc::clone(&table);
        let handle = thread::spawn(move || {
            let _g = t.rlock(b"key");
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_swapped_batches_never_deadlock() {
        let table = Arc::new(LockTable::new(64));
        let keys: Vec<String> = (0..32).map(|i| format!("key:{}", i)).collect();
        let mut reversed = keys.clone();
        reversed.reverse();

        let mut handles = Vec::new();
        for batch in [keys, reversed] {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    let _g = table.lock_many(batch.as_slice());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_disjoint_batches_run_together() {
        let table = Arc::new(LockTable::new(1024));
        let a = ["alpha"];
        let b: Vec<&str> = ["beta", "gamma", "delta"]
            .into_iter()
            .filter(|k| table.slot_of(k.as_bytes()) != table.slot_of(b"alpha"))
            .collect();

        let held = table.lock_many(&a);
        let t = Arc::clone(&table);
        let b: Vec<String> = b.into_iter().map(String::from).collect();
        let handle = thread::spawn(move || {
            let _g = t.lock_many(b.as_slice());
        });
        handle.join().unwrap();
        drop(held);
    }
}
