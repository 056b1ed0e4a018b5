//! # String & Sorted-Set Commands
//!
//! Purpose: exec (and, where the spec calls for it, undo) implementations
//! over the two supported data types, plus key-management commands shared
//! by both.
//!
//! Every executor receives an already-acquired [`MultiKeyLock`] over the
//! data dict — never call a `Database` method that itself locks the data
//! dict (`get_entity`, `remove`) from inside an executor; use `live_entry`
//! and the lock directly instead. TTL-dict/timer helpers (`expire_at`,
//! `persist`) are a separate structure and are safe to call freely.

mod keys;
mod string;
mod zset;

use std::sync::Arc;

use hkv_common::Reply;

use crate::database::Database;
use crate::entity::DataEntity;
use crate::registry::{CommandRegistry, CommandSpec, KeySpec, UndoGenerator};
use crate::sharded_map::MultiKeyLock;

/// Reads `key` through the lock, treating an expired-but-unswept entry as
/// absent without attempting to delete it (deletion needs a write lock this
/// helper can't assume the caller holds).
pub(crate) fn live_entry<'a>(db: &Database, lock: &'a MultiKeyLock<'_, DataEntity>, key: &[u8]) -> Option<&'a DataEntity> {
    if db.is_expired(key) {
        None
    } else {
        lock.get(key)
    }
}

pub(crate) fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

pub(crate) fn parse_f64(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

pub(crate) fn err(message: impl Into<String>) -> Reply {
    Reply::Error(message.into())
}

pub fn register_all(registry: &mut CommandRegistry) {
    string::register(registry);
    keys::register(registry);
    zset::register(registry);
}

pub(crate) fn spec(
    name: &'static str,
    arity: i32,
    key_spec: KeySpec,
    exec: fn(&Arc<Database>, &mut MultiKeyLock<'_, DataEntity>, &[Vec<u8>]) -> Reply,
) -> CommandSpec {
    CommandSpec { name, arity, key_spec, exec, undo: None }
}

pub(crate) fn spec_with_undo(
    name: &'static str,
    arity: i32,
    key_spec: KeySpec,
    exec: fn(&Arc<Database>, &mut MultiKeyLock<'_, DataEntity>, &[Vec<u8>]) -> Reply,
    undo: UndoGenerator,
) -> CommandSpec {
    CommandSpec { name, arity, key_spec, exec, undo: Some(undo) }
}

/// Captures enough of `key`'s current state (before the caller's command
/// runs) to produce a command that restores it exactly: `DEL` if absent,
/// otherwise a full value rebuild (mirroring the AOF rewriter's snapshot
/// encoding) followed by its TTL or `PERSIST` if it had none.
///
/// Reads `key` through the batch's already-held `lock` rather than through a
/// `Database` method that would lock the data dict again on its own.
pub(crate) fn snapshot_undo(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, keys: &[&[u8]]) -> Vec<Vec<Vec<u8>>> {
    keys.iter().flat_map(|key| restore_value_commands(db, lock, key)).collect()
}

fn restore_value_commands(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, key: &[u8]) -> Vec<Vec<Vec<u8>>> {
    match live_entry(db, lock, key) {
        None => vec![vec![b"DEL".to_vec(), key.to_vec()]],
        Some(DataEntity::Bytes(value)) => {
            let mut out = vec![vec![b"SET".to_vec(), key.to_vec(), value.clone()]];
            out.push(restore_ttl_command(db, key));
            out
        }
        Some(DataEntity::SortedSet(set)) => {
            let mut out = vec![vec![b"DEL".to_vec(), key.to_vec()]];
            let mut zadd = vec![b"ZADD".to_vec(), key.to_vec()];
            set.for_each(|member, score| {
                zadd.push(format_score(score).into_bytes());
                zadd.push(member.to_vec());
            });
            if zadd.len() > 2 {
                out.push(zadd);
            }
            if db.expire_at_millis(key).is_some() {
                out.push(restore_ttl_command(db, key));
            }
            out
        }
    }
}

/// Captures just `key`'s TTL, for commands that only ever touch expiry
/// (`EXPIRE`/`PERSIST`/…) and so don't need a full value snapshot.
pub(crate) fn ttl_undo(db: &Arc<Database>, key: &[u8]) -> Vec<Vec<Vec<u8>>> {
    vec![restore_ttl_command(db, key)]
}

fn restore_ttl_command(db: &Arc<Database>, key: &[u8]) -> Vec<Vec<u8>> {
    match db.expire_at_millis(key) {
        Some(at) => vec![b"PEXPIREAT".to_vec(), key.to_vec(), at.to_string().into_bytes()],
        None => vec![b"PERSIST".to_vec(), key.to_vec()],
    }
}

pub(crate) fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.is_finite() {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}
