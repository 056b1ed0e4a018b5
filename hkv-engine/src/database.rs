//! # Database
//!
//! Purpose: one of the process's fixed array of databases (`SELECT 0..N-1`).
//! Owns the data dict, the ttl dict, and the version map, and wires them to
//! the hashed-wheel timer for delete-on-access plus proactive expiry.
//!
//! ## Design Principles
//! 1. **Lazy + Active Expiry**: every read path calls `get_entity`, which
//!    checks `ttl` itself before touching `data`; a timer task additionally
//!    sweeps the key proactively so idle keys don't linger in memory.
//! 2. **Version Bump On Write**: any executor that successfully mutates a
//!    key must call `bump_version` for every key it wrote, under the same
//!    multi-key lock it used for the mutation.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hkv_common::HkvResult;

use crate::entity::DataEntity;
use crate::sharded_map::ShardedMap;
use crate::timer::TimerHandle;

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn expire_timer_key(db_index: usize, key: &[u8]) -> String {
    format!("expire:{db_index}:{}:{}", key.len(), String::from_utf8_lossy(key))
}

/// One independent keyspace; a process holds a fixed array of these (default 16).
pub struct Database {
    pub index: usize,
    pub data: ShardedMap<DataEntity>,
    pub ttl: ShardedMap<i64>,
    pub version: ShardedMap<u64>,
    timer: TimerHandle,
}

/// TTL/PTTL reply shape: -2 missing, -1 no expiry, or remaining time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    Missing,
    NoExpiry,
    RemainingMillis(i64),
}

impl Database {
    pub fn new(index: usize, shard_count: usize, timer: TimerHandle) -> Arc<Self> {
        Arc::new(Database {
            index,
            data: ShardedMap::new(shard_count),
            ttl: ShardedMap::new(shard_count),
            version: ShardedMap::new(shard_count),
            timer,
        })
    }

    /// Looks up `key`'s entity, treating an expired-but-not-yet-swept key as
    /// absent and deleting it lazily (`GetEntity` in the component design).
    pub fn get_entity(&self, key: &[u8]) -> Option<DataEntity> {
        if self.is_expired(key) {
            self.remove(key);
            return None;
        }
        self.data.get(key)
    }

    pub(crate) fn is_expired(&self, key: &[u8]) -> bool {
        match self.ttl.get(key) {
            Some(at) => now_millis() > at,
            None => false,
        }
    }

    /// Schedules (or reschedules) the key's proactive expiry task and
    /// records its absolute deadline in the ttl dict.
    pub fn expire_at(self: &Arc<Self>, key: &[u8], at_millis: i64) {
        self.ttl.put(key.to_vec(), at_millis);
        let db = Arc::clone(self);
        let owned_key = key.to_vec();
        let delay_ms = (at_millis - now_millis()).max(0) as u64;
        self.timer.schedule(
            expire_timer_key(self.index, key),
            Duration::from_millis(delay_ms),
            move || {
                if db.is_expired(&owned_key) {
                    db.remove(&owned_key);
                }
            },
        );
    }

    /// Removes a TTL entry and cancels its pending expiry task.
    pub fn persist(&self, key: &[u8]) -> bool {
        let had = self.ttl.delete(key).is_some();
        if had {
            self.timer.cancel(expire_timer_key(self.index, key));
        }
        had
    }

    /// Clears both dicts and cancels the expiry task; used by DEL and by
    /// the expiry callback itself.
    pub fn remove(&self, key: &[u8]) -> bool {
        let removed = self.data.delete(key).is_some();
        if self.ttl.delete(key).is_some() {
            self.timer.cancel(expire_timer_key(self.index, key));
        }
        removed
    }

    pub fn ttl_status(&self, key: &[u8]) -> TtlStatus {
        if self.get_entity(key).is_none() {
            return TtlStatus::Missing;
        }
        match self.ttl.get(key) {
            None => TtlStatus::NoExpiry,
            Some(at) => TtlStatus::RemainingMillis((at - now_millis()).max(0)),
        }
    }

    pub fn expire_at_millis(&self, key: &[u8]) -> Option<i64> {
        if self.get_entity(key).is_none() {
            return None;
        }
        self.ttl.get(key)
    }

    /// Raw ttl-dict lookup, bypassing the data-dict presence check — safe
    /// to call from inside a command executor that already holds a lock on
    /// the data dict, since it never touches that structure.
    pub(crate) fn raw_ttl_at(&self, key: &[u8]) -> Option<i64> {
        self.ttl.get(key)
    }

    /// Bumps `key`'s write version by one, returning the new value. Callers
    /// must already hold the write lock for `key`'s shard.
    pub fn bump_version(&self, key: &[u8]) -> u64 {
        self.version.add_delta(key, 1)
    }

    pub fn get_version(&self, key: &[u8]) -> u64 {
        self.version.get(key).unwrap_or(0)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.get_entity(key).is_some()
    }

    pub fn keys_matching(&self, pattern: &hkv_common::GlobPattern) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.data.for_each(|key, _| {
            if pattern.matches(key) {
                out.push(key.to_vec());
            }
            true
        });
        out.retain(|k| !self.is_expired(k));
        out
    }

    /// Resets this database to empty; used by replay's implicit flush and tests.
    pub fn flush(&self) {
        let mut keys = Vec::new();
        self.data.for_each(|k, _| {
            keys.push(k.to_vec());
            true
        });
        for k in keys {
            self.remove(&k);
        }
    }
}

pub fn current_millis() -> i64 {
    now_millis()
}

pub type DbResult<T> = HkvResult<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimeWheel;

    fn test_db() -> (Arc<Database>, TimeWheel) {
        let wheel = TimeWheel::start(Duration::from_millis(5), 64);
        let db = Database::new(0, 4, wheel.handle());
        (db, wheel)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let (db, _wheel) = test_db();
        db.data.put(b"k".to_vec(), DataEntity::Bytes(b"v".to_vec()));
        assert!(db.get_entity(b"k").is_some());
        assert!(db.remove(b"k"));
        assert!(db.get_entity(b"k").is_none());
    }

    #[test]
    fn expiry_removes_key_lazily_and_proactively() {
        let (db, _wheel) = test_db();
        db.data.put(b"k".to_vec(), DataEntity::Bytes(b"v".to_vec()));
        db.expire_at(b"k", now_millis() - 1);
        assert!(db.get_entity(b"k").is_none());
    }

    #[test]
    fn persist_cancels_ttl() {
        let (db, _wheel) = test_db();
        db.data.put(b"k".to_vec(), DataEntity::Bytes(b"v".to_vec()));
        db.expire_at(b"k", now_millis() + 100_000);
        assert!(db.persist(b"k"));
        assert_eq!(db.ttl_status(b"k"), TtlStatus::NoExpiry);
    }

    #[test]
    fn version_bumps_monotonically() {
        let (db, _wheel) = test_db();
        assert_eq!(db.bump_version(b"k"), 1);
        assert_eq!(db.bump_version(b"k"), 2);
        assert_eq!(db.get_version(b"k"), 2);
    }
}
