use std::sync::Arc;

use hkv_common::Reply;

use crate::database::{current_millis, Database};
use crate::entity::DataEntity;
use crate::registry::{CommandRegistry, KeySpec};
use crate::sharded_map::MultiKeyLock;

use super::{err, live_entry, parse_i64, snapshot_undo};

pub fn register(registry: &mut CommandRegistry) {
    registry.register(super::spec("GET", 2, KeySpec::ReadFirst, exec_get));
    registry.register(super::spec_with_undo("SET", -3, KeySpec::WriteFirst, exec_set, undo_set));
    registry.register(super::spec_with_undo("MSET", -3, KeySpec::WriteAlternating(2), exec_mset, undo_mset));
}

fn undo_set(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    snapshot_undo(db, lock, &[&args[0]])
}

fn undo_mset(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    let keys: Vec<&[u8]> = args.chunks(2).filter_map(|pair| pair.first().map(|k| k.as_slice())).collect();
    snapshot_undo(db, lock, &keys)
}

fn exec_get(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    match live_entry(db, lock, key) {
        None => Reply::nil(),
        Some(DataEntity::Bytes(value)) => Reply::bulk(value.clone()),
        Some(DataEntity::SortedSet(_)) => Reply::from(hkv_common::HkvError::WrongType),
    }
}

#[derive(Default)]
struct SetOptions {
    nx: bool,
    xx: bool,
    expire_ms: Option<i64>,
}

fn parse_set_options(rest: &[Vec<u8>]) -> Result<SetOptions, Reply> {
    let mut opts = SetOptions::default();
    let mut i = 0;
    while i < rest.len() {
        let token = String::from_utf8_lossy(&rest[i]).to_ascii_uppercase();
        match token.as_str() {
            "NX" => {
                if opts.xx {
                    return Err(err("syntax error: NX and XX are mutually exclusive"));
                }
                opts.nx = true;
                i += 1;
            }
            "XX" => {
                if opts.nx {
                    return Err(err("syntax error: NX and XX are mutually exclusive"));
                }
                opts.xx = true;
                i += 1;
            }
            "EX" | "PX" => {
                let Some(raw) = rest.get(i + 1) else {
                    return Err(err("syntax error: missing value for EX/PX"));
                };
                let Some(value) = parse_i64(raw) else {
                    return Err(err("value is not an integer or out of range"));
                };
                if value <= 0 {
                    return Err(err("invalid expire time"));
                }
                opts.expire_ms = Some(if token == "EX" { value * 1000 } else { value });
                i += 2;
            }
            _ => return Err(err(format!("syntax error near '{token}'"))),
        }
    }
    Ok(opts)
}

fn exec_set(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    let value = &args[1];
    let opts = match parse_set_options(&args[2..]) {
        Ok(opts) => opts,
        Err(reply) => return reply,
    };

    let exists = live_entry(db, lock, key).is_some();
    if opts.nx && exists {
        return Reply::nil();
    }
    if opts.xx && !exists {
        return Reply::nil();
    }

    lock.put(key.clone(), DataEntity::Bytes(value.clone()));
    match opts.expire_ms {
        Some(ms) => db.expire_at(key, current_millis() + ms),
        None => {
            db.persist(key);
        }
    }
    Reply::ok()
}

fn exec_mset(_db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    if args.len() % 2 != 0 {
        return err("wrong number of arguments for MSET");
    }
    for pair in args.chunks(2) {
        lock.put(pair[0].clone(), DataEntity::Bytes(pair[1].clone()));
    }
    Reply::ok()
}

/// Referenced by the AOF rewriter to reproduce the minimal command needed
/// to reconstruct a byte-string entity.
pub fn rebuild_set_command(key: &[u8], value: &[u8]) -> Vec<Vec<u8>> {
    vec![b"SET".to_vec(), key.to_vec(), value.to_vec()]
}
