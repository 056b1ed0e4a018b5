use std::sync::Arc;

use hkv_common::{GlobPattern, Reply};

use crate::database::{current_millis, Database};
use crate::entity::DataEntity;
use crate::registry::{CommandRegistry, KeySpec};
use crate::sharded_map::MultiKeyLock;

use super::{err, live_entry, parse_i64, snapshot_undo, ttl_undo};

pub fn register(registry: &mut CommandRegistry) {
    registry.register(super::spec_with_undo("DEL", -2, KeySpec::WriteAll, exec_del, undo_del));
    registry.register(super::spec("EXISTS", -2, KeySpec::ReadAll, exec_exists));
    registry.register(super::spec("KEYS", 2, KeySpec::None, exec_keys));
    registry.register(super::spec_with_undo("EXPIRE", -3, KeySpec::WriteFirst, exec_expire, undo_ttl_only));
    registry.register(super::spec_with_undo("PEXPIRE", -3, KeySpec::WriteFirst, exec_pexpire, undo_ttl_only));
    registry.register(super::spec_with_undo("EXPIREAT", -3, KeySpec::WriteFirst, exec_expireat, undo_ttl_only));
    registry.register(super::spec_with_undo("PEXPIREAT", -3, KeySpec::WriteFirst, exec_pexpireat, undo_ttl_only));
    registry.register(super::spec("EXPIRETIME", 2, KeySpec::ReadFirst, exec_expiretime));
    registry.register(super::spec("PEXPIRETIME", 2, KeySpec::ReadFirst, exec_pexpiretime));
    registry.register(super::spec("TTL", 2, KeySpec::ReadFirst, exec_ttl));
    registry.register(super::spec("PTTL", 2, KeySpec::ReadFirst, exec_pttl));
    registry.register(super::spec_with_undo("PERSIST", 2, KeySpec::WriteFirst, exec_persist, undo_ttl_only));
}

fn undo_del(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    let keys: Vec<&[u8]> = args.iter().map(|k| k.as_slice()).collect();
    snapshot_undo(db, lock, &keys)
}

/// `EXPIRE`/`PEXPIRE`/`EXPIREAT`/`PEXPIREAT`/`PERSIST` only ever touch a
/// key's TTL, never its value, so undo only needs to restore the TTL.
fn undo_ttl_only(db: &Arc<Database>, _lock: &MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    ttl_undo(db, &args[0])
}

fn exec_del(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let mut deleted = 0i64;
    for key in args {
        if lock.delete(key).is_some() {
            deleted += 1;
        }
        db.persist(key);
    }
    Reply::Integer(deleted)
}

fn exec_exists(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let count = args.iter().filter(|key| live_entry(db, lock, key).is_some()).count();
    Reply::Integer(count as i64)
}

fn exec_keys(db: &Arc<Database>, _lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let pattern = GlobPattern::compile(&args[0]);
    let keys = db.keys_matching(&pattern);
    Reply::Array(keys.into_iter().map(Reply::bulk).collect())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ExpireModifier {
    None,
    Nx,
    Xx,
    Gt,
    Lt,
}

fn parse_modifier(token: Option<&Vec<u8>>) -> Result<ExpireModifier, Reply> {
    match token {
        None => Ok(ExpireModifier::None),
        Some(raw) => match String::from_utf8_lossy(raw).to_ascii_uppercase().as_str() {
            "NX" => Ok(ExpireModifier::Nx),
            "XX" => Ok(ExpireModifier::Xx),
            "GT" => Ok(ExpireModifier::Gt),
            "LT" => Ok(ExpireModifier::Lt),
            other => Err(err(format!("syntax error near '{other}'"))),
        },
    }
}

/// Shared EXPIRE/PEXPIRE/EXPIREAT/PEXPIREAT body: `at_millis` is the
/// already-computed absolute deadline.
fn apply_expiry(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, key: &[u8], at_millis: i64, modifier: ExpireModifier) -> Reply {
    if live_entry(db, lock, key).is_none() {
        return Reply::Integer(0);
    }
    let current = db.raw_ttl_at(key);
    let admitted = match modifier {
        ExpireModifier::None => true,
        ExpireModifier::Nx => current.is_none(),
        ExpireModifier::Xx => current.is_some(),
        ExpireModifier::Gt => current.map(|c| at_millis > c).unwrap_or(false),
        ExpireModifier::Lt => current.map(|c| at_millis < c).unwrap_or(true),
    };
    if !admitted {
        return Reply::Integer(0);
    }
    db.expire_at(key, at_millis);
    Reply::Integer(1)
}

fn exec_expire(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let Some(seconds) = parse_i64(&args[1]) else {
        return err("value is not an integer or out of range");
    };
    let modifier = match parse_modifier(args.get(2)) {
        Ok(m) => m,
        Err(reply) => return reply,
    };
    apply_expiry(db, lock, &args[0], current_millis() + seconds * 1000, modifier)
}

fn exec_pexpire(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let Some(ms) = parse_i64(&args[1]) else {
        return err("value is not an integer or out of range");
    };
    let modifier = match parse_modifier(args.get(2)) {
        Ok(m) => m,
        Err(reply) => return reply,
    };
    apply_expiry(db, lock, &args[0], current_millis() + ms, modifier)
}

fn exec_expireat(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let Some(seconds) = parse_i64(&args[1]) else {
        return err("value is not an integer or out of range");
    };
    let modifier = match parse_modifier(args.get(2)) {
        Ok(m) => m,
        Err(reply) => return reply,
    };
    apply_expiry(db, lock, &args[0], seconds * 1000, modifier)
}

fn exec_pexpireat(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let Some(ms) = parse_i64(&args[1]) else {
        return err("value is not an integer or out of range");
    };
    let modifier = match parse_modifier(args.get(2)) {
        Ok(m) => m,
        Err(reply) => return reply,
    };
    apply_expiry(db, lock, &args[0], ms, modifier)
}

fn exec_expiretime(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    if live_entry(db, lock, &args[0]).is_none() {
        return Reply::Integer(-2);
    }
    match db.raw_ttl_at(&args[0]) {
        None => Reply::Integer(-1),
        Some(at_millis) => Reply::Integer(at_millis / 1000),
    }
}

fn exec_pexpiretime(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    if live_entry(db, lock, &args[0]).is_none() {
        return Reply::Integer(-2);
    }
    match db.raw_ttl_at(&args[0]) {
        None => Reply::Integer(-1),
        Some(at_millis) => Reply::Integer(at_millis),
    }
}

fn exec_ttl(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    if live_entry(db, lock, &args[0]).is_none() {
        return Reply::Integer(-2);
    }
    match db.raw_ttl_at(&args[0]) {
        None => Reply::Integer(-1),
        Some(at_millis) => Reply::Integer(((at_millis - current_millis()).max(0)) / 1000),
    }
}

fn exec_pttl(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    if live_entry(db, lock, &args[0]).is_none() {
        return Reply::Integer(-2);
    }
    match db.raw_ttl_at(&args[0]) {
        None => Reply::Integer(-1),
        Some(at_millis) => Reply::Integer((at_millis - current_millis()).max(0)),
    }
}

fn exec_persist(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    if live_entry(db, lock, &args[0]).is_none() {
        return Reply::Integer(0);
    }
    if db.persist(&args[0]) {
        Reply::Integer(1)
    } else {
        Reply::Integer(0)
    }
}
