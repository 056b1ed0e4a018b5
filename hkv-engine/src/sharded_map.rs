//! # Sharded Concurrent Map
//!
//! Purpose: the single synchronization primitive for key/value state. An
//! array of `2^k` shards, each a plain hash table behind its own read/write
//! lock; a key's shard is the low-order bits of its FNV-1a-32 hash.
//!
//! Three instances of this type back a `Database`: the data dict, the ttl
//! dict, and the version map.
//!
//! ## Design Principles
//! 1. **Sorted Multi-Key Locking**: any operation touching more than one key
//!    acquires shards in ascending index order so two overlapping operations
//!    can never deadlock (see `lock_many`).
//! 2. **Write Upgrades Read**: a shard touched by both a read key and a write
//!    key is locked for write.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use hkv_common::hash::{fnv1a32, normalize_shard_count};

type Table<V> = HashMap<Vec<u8>, V, ahash::RandomState>;

struct Shard<V> {
    inner: parking_lot::RwLock<Table<V>>,
}

/// An N-way striped map from byte-string keys to `V`.
pub struct ShardedMap<V> {
    shards: Vec<Shard<V>>,
    mask: usize,
    count: std::sync::atomic::AtomicI64,
}

impl<V> ShardedMap<V> {
    pub fn new(requested_shards: usize) -> Self {
        let shard_count = normalize_shard_count(requested_shards);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard {
                inner: parking_lot::RwLock::new(Table::default()),
            });
        }
        ShardedMap {
            shards,
            mask: shard_count - 1,
            count: std::sync::atomic::AtomicI64::new(0),
        }
    }

    pub fn shard_index(&self, key: &[u8]) -> usize {
        (fnv1a32(key) as usize) & self.mask
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Live entry count; updated only on true insert/delete, not on update.
    pub fn len(&self) -> i64 {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_count(&self, delta: i64) {
        self.count.fetch_add(delta, std::sync::atomic::Ordering::Relaxed);
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &[u8]) -> Option<V> {
        let shard = &self.shards[self.shard_index(key)];
        shard.inner.read().get(key).cloned()
    }
}

impl<V> ShardedMap<V> {
    /// Insert-or-update; returns the previous value if any.
    pub fn put(&self, key: Vec<u8>, value: V) -> Option<V> {
        let shard = &self.shards[self.shard_index(&key)];
        let mut table = shard.inner.write();
        let old = table.insert(key, value);
        if old.is_none() {
            self.add_count(1);
        }
        old
    }

    /// Insert only if absent; returns false without modifying if present.
    pub fn put_if_absent(&self, key: Vec<u8>, value: V) -> bool {
        let shard = &self.shards[self.shard_index(&key)];
        let mut table = shard.inner.write();
        if table.contains_key(&key) {
            return false;
        }
        table.insert(key, value);
        self.add_count(1);
        true
    }

    /// Update only if present; returns false without modifying if absent.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> bool {
        let shard = &self.shards[self.shard_index(key)];
        let mut table = shard.inner.write();
        match table.get_mut(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &[u8]) -> Option<V> {
        let shard = &self.shards[self.shard_index(key)];
        let mut table = shard.inner.write();
        let removed = table.remove(key);
        if removed.is_some() {
            self.add_count(-1);
        }
        removed
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let shard = &self.shards[self.shard_index(key)];
        shard.inner.read().contains_key(key)
    }

    /// Iterates every shard in turn, holding each shard's read lock only for
    /// the duration of that shard's callback. Stops early if `f` returns false.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &V) -> bool) {
        for shard in &self.shards {
            let table = shard.inner.read();
            for (key, value) in table.iter() {
                if !f(key, value) {
                    return;
                }
            }
        }
    }

    /// Mutates a single existing key in place; no-op if absent.
    pub fn with_mut<R>(&self, key: &[u8], f: impl FnOnce(Option<&mut V>) -> R) -> R {
        let shard = &self.shards[self.shard_index(key)];
        let mut table = shard.inner.write();
        f(table.get_mut(key))
    }
}

impl<V: Copy + Default + std::ops::AddAssign> ShardedMap<V> {
    /// Adds `delta` to the counter stored at `key`, creating it at `delta`
    /// (i.e. `default() + delta`) if absent. Backs the version map's
    /// per-key monotonic counters.
    pub fn add_delta(&self, key: &[u8], delta: V) -> V {
        let shard = &self.shards[self.shard_index(key)];
        let mut table = shard.inner.write();
        let entry = table.entry(key.to_vec()).or_insert_with(V::default);
        *entry += delta;
        *entry
    }
}

enum Guard<'a, V> {
    Read(RwLockReadGuard<'a, Table<V>>),
    Write(RwLockWriteGuard<'a, Table<V>>),
}

/// Holds the locks acquired by [`ShardedMap::lock_many`] for their lifetime.
///
/// Shard indices are kept sorted ascending; lookups binary-search the slice.
pub struct MultiKeyLock<'a, V> {
    map: &'a ShardedMap<V>,
    guards: Vec<(usize, Guard<'a, V>)>,
}

impl<'a, V> MultiKeyLock<'a, V> {
    fn guard_for(&self, key: &[u8]) -> &Guard<'a, V> {
        let idx = self.map.shard_index(key);
        let pos = self
            .guards
            .binary_search_by_key(&idx, |&(shard_idx, _)| shard_idx)
            .expect("key's shard was not part of the acquired lock set");
        &self.guards[pos].1
    }

    fn guard_for_mut(&mut self, key: &[u8]) -> &mut Guard<'a, V> {
        let idx = self.map.shard_index(key);
        let pos = self
            .guards
            .binary_search_by_key(&idx, |&(shard_idx, _)| shard_idx)
            .expect("key's shard was not part of the acquired lock set");
        &mut self.guards[pos].1
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        match self.guard_for(key) {
            Guard::Read(g) => g.get(key),
            Guard::Write(g) => g.get(key),
        }
    }

    /// Panics if `key`'s shard was locked read-only; callers must list every
    /// key they intend to mutate among `write_keys` when acquiring the lock.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        match self.guard_for_mut(key) {
            Guard::Write(g) => g.get_mut(key),
            Guard::Read(_) => panic!("get_mut on a key whose shard is read-locked"),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: V) -> Option<V> {
        let was_present = self.get(&key).is_some();
        let out = match self.guard_for_mut(&key) {
            Guard::Write(g) => g.insert(key, value),
            Guard::Read(_) => panic!("put on a key whose shard is read-locked"),
        };
        if !was_present {
            self.map.add_count(1);
        }
        out
    }

    pub fn delete(&mut self, key: &[u8]) -> Option<V> {
        let out = match self.guard_for_mut(key) {
            Guard::Write(g) => g.remove(key),
            Guard::Read(_) => panic!("delete on a key whose shard is read-locked"),
        };
        if out.is_some() {
            self.map.add_count(-1);
        }
        out
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

impl<V> ShardedMap<V> {
    /// Acquires locks over every shard touched by `read_keys ∪ write_keys`,
    /// in ascending shard-index order, write-locking any shard touched by a
    /// write key. See §4.1: this ordering is what makes the contract
    /// deadlock-free across overlapping multi-key operations.
    pub fn lock_many<'a>(&'a self, read_keys: &[&[u8]], write_keys: &[&[u8]]) -> MultiKeyLock<'a, V> {
        let mut write_shards = BTreeSet::new();
        let mut all_shards = BTreeSet::new();
        for key in write_keys {
            let idx = self.shard_index(key);
            write_shards.insert(idx);
            all_shards.insert(idx);
        }
        for key in read_keys {
            all_shards.insert(self.shard_index(key));
        }

        let mut guards = Vec::with_capacity(all_shards.len());
        for idx in all_shards {
            let shard = &self.shards[idx];
            if write_shards.contains(&idx) {
                guards.push((idx, Guard::Write(shard.inner.write())));
            } else {
                guards.push((idx, Guard::Read(shard.inner.read())));
            }
        }

        MultiKeyLock { map: self, guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let map: ShardedMap<i32> = ShardedMap::new(4);
        assert_eq!(map.put(b"a".to_vec(), 1), None);
        assert_eq!(map.get(b"a"), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.put(b"a".to_vec(), 2), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.delete(b"a"), Some(2));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn put_if_absent_and_exists() {
        let map: ShardedMap<i32> = ShardedMap::new(2);
        assert!(map.put_if_absent(b"k".to_vec(), 1));
        assert!(!map.put_if_absent(b"k".to_vec(), 2));
        assert_eq!(map.get(b"k"), Some(1));
        assert!(map.put_if_exists(b"k", 9));
        assert_eq!(map.get(b"k"), Some(9));
        assert!(!map.put_if_exists(b"missing", 1));
    }

    #[test]
    fn multi_key_lock_upgrades_shared_shard_to_write() {
        let map: ShardedMap<i32> = ShardedMap::new(8);
        map.put(b"read-key".to_vec(), 10);
        let mut lock = map.lock_many(&[b"read-key"], &[b"write-key"]);
        assert_eq!(lock.get(b"read-key"), Some(&10));
        lock.put(b"write-key".to_vec(), 5);
        drop(lock);
        assert_eq!(map.get(b"write-key"), Some(5));
    }

    #[test]
    fn add_delta_creates_and_increments() {
        let map: ShardedMap<u64> = ShardedMap::new(2);
        assert_eq!(map.add_delta(b"k", 1), 1);
        assert_eq!(map.add_delta(b"k", 1), 2);
    }

    #[test]
    fn for_each_visits_all_entries_and_respects_early_stop() {
        let map: ShardedMap<i32> = ShardedMap::new(4);
        for i in 0..10 {
            map.put(vec![i as u8], i);
        }
        let mut seen = 0;
        map.for_each(|_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 10);

        let mut stopped_at = 0;
        map.for_each(|_, _| {
            stopped_at += 1;
            stopped_at < 3
        });
        assert_eq!(stopped_at, 3);
    }
}
