use std::sync::Arc;

use hkv_common::Reply;

use crate::border::{LexBorder, ScoreBorder};
use crate::database::Database;
use crate::entity::DataEntity;
use crate::registry::{CommandRegistry, KeySpec};
use crate::sharded_map::MultiKeyLock;
use crate::sortedset::{ScoredMember, SortedSet};

use super::{err, live_entry, parse_f64, parse_i64, snapshot_undo};

pub fn register(registry: &mut CommandRegistry) {
    registry.register(super::spec_with_undo("ZADD", -4, KeySpec::WriteFirst, exec_zadd, undo_single_key));
    registry.register(super::spec("ZSCORE", 3, KeySpec::ReadFirst, exec_zscore));
    registry.register(super::spec_with_undo("ZINCRBY", 4, KeySpec::WriteFirst, exec_zincrby, undo_single_key));
    registry.register(super::spec("ZRANK", -3, KeySpec::ReadFirst, exec_zrank));
    registry.register(super::spec("ZREVRANK", -3, KeySpec::ReadFirst, exec_zrevrank));
    registry.register(super::spec("ZCOUNT", 4, KeySpec::ReadFirst, exec_zcount));
    registry.register(super::spec("ZCARD", 2, KeySpec::ReadFirst, exec_zcard));
    registry.register(super::spec("ZRANGE", -4, KeySpec::ReadFirst, exec_zrange));
    registry.register(super::spec("ZREVRANGE", -4, KeySpec::ReadFirst, exec_zrevrange));
    registry.register(super::spec("ZRANGEBYSCORE", -4, KeySpec::ReadFirst, exec_zrangebyscore));
    registry.register(super::spec("ZREVRANGEBYSCORE", -4, KeySpec::ReadFirst, exec_zrevrangebyscore));
    registry.register(super::spec("ZRANGEBYLEX", -4, KeySpec::ReadFirst, exec_zrangebylex));
    registry.register(super::spec_with_undo("ZPOPMIN", -2, KeySpec::WriteFirst, exec_zpopmin, undo_single_key));
    registry.register(super::spec_with_undo("ZREM", -3, KeySpec::WriteFirst, exec_zrem, undo_single_key));
    registry.register(super::spec_with_undo("ZREMRANGEBYSCORE", 4, KeySpec::WriteFirst, exec_zremrangebyscore, undo_single_key));
    registry.register(super::spec_with_undo("ZREMRANGEBYRANK", 4, KeySpec::WriteFirst, exec_zremrangebyrank, undo_single_key));
}

/// Every sorted-set write command's first argument is the key it mutates.
fn undo_single_key(db: &Arc<Database>, lock: &MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    snapshot_undo(db, lock, &[&args[0]])
}

fn read_zset<'a>(db: &Database, lock: &'a MultiKeyLock<'_, DataEntity>, key: &[u8]) -> Result<Option<&'a SortedSet>, Reply> {
    match live_entry(db, lock, key) {
        None => Ok(None),
        Some(entity) => entity.as_sorted_set().map(Some).map_err(Reply::from),
    }
}

fn members_reply(members: Vec<ScoredMember>, with_scores: bool) -> Reply {
    let mut out = Vec::with_capacity(members.len() * if with_scores { 2 } else { 1 });
    for m in members {
        out.push(Reply::bulk(m.member));
        if with_scores {
            out.push(Reply::Bulk(Some(format_score(m.score).into_bytes())));
        }
    }
    Reply::Array(out)
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.is_finite() {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

fn exec_zadd(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return err("syntax error");
    }
    let mut parsed = Vec::with_capacity(pairs.len() / 2);
    for chunk in pairs.chunks(2) {
        let Some(score) = parse_f64(&chunk[0]) else {
            return err("value is not a valid float");
        };
        parsed.push((score, chunk[1].clone()));
    }

    if live_entry(db, lock, key).is_none() {
        lock.put(key.clone(), DataEntity::SortedSet(SortedSet::new()));
    }
    let set = match lock.get_mut(key).unwrap().as_sorted_set_mut() {
        Ok(set) => set,
        Err(e) => return Reply::from(e),
    };
    let mut added = 0i64;
    for (score, member) in parsed {
        if set.add(member, score) {
            added += 1;
        }
    }
    Reply::Integer(added)
}

fn exec_zscore(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return Reply::nil(),
        Err(reply) => return reply,
    };
    match set.score(&args[1]) {
        Some(score) => Reply::bulk(format_score(score).into_bytes()),
        None => Reply::nil(),
    }
}

fn exec_zincrby(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    let Some(delta) = parse_f64(&args[1]) else {
        return err("value is not a valid float");
    };
    let member = &args[2];

    if live_entry(db, lock, key).is_none() {
        lock.put(key.clone(), DataEntity::SortedSet(SortedSet::new()));
    }
    let set = match lock.get_mut(key).unwrap().as_sorted_set_mut() {
        Ok(set) => set,
        Err(e) => return Reply::from(e),
    };
    let new_score = set.incr_by(member, delta);
    Reply::bulk(format_score(new_score).into_bytes())
}

fn rank_reply(set: &SortedSet, member: &[u8], desc: bool, with_score: bool) -> Reply {
    match set.rank(member, desc) {
        None => if with_score { Reply::NullArray } else { Reply::nil() },
        Some(rank) => {
            if with_score {
                let score = set.score(member).unwrap_or(0.0);
                Reply::Array(vec![Reply::Integer(rank as i64), Reply::bulk(format_score(score).into_bytes())])
            } else {
                Reply::Integer(rank as i64)
            }
        }
    }
}

fn exec_zrank(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let with_score = matches!(args.get(2), Some(flag) if flag.eq_ignore_ascii_case(b"WITHSCORE"));
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return if with_score { Reply::NullArray } else { Reply::nil() },
        Err(reply) => return reply,
    };
    rank_reply(set, &args[1], false, with_score)
}

fn exec_zrevrank(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let with_score = matches!(args.get(2), Some(flag) if flag.eq_ignore_ascii_case(b"WITHSCORE"));
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return if with_score { Reply::NullArray } else { Reply::nil() },
        Err(reply) => return reply,
    };
    rank_reply(set, &args[1], true, with_score)
}

fn exec_zcount(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return Reply::Integer(0),
        Err(reply) => return reply,
    };
    let (Some(min), Some(max)) = (ScoreBorder::parse(&String::from_utf8_lossy(&args[1])), ScoreBorder::parse(&String::from_utf8_lossy(&args[2]))) else {
        return err("min or max is not a float");
    };
    Reply::Integer(set.count_by_score(&min, &max) as i64)
}

fn exec_zcard(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => Reply::Integer(set.len() as i64),
        Ok(None) => Reply::Integer(0),
        Err(reply) => reply,
    }
}

fn exec_zrange(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    zrange_by_rank(db, lock, args, false)
}

fn exec_zrevrange(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    zrange_by_rank(db, lock, args, true)
}

fn zrange_by_rank(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>], desc: bool) -> Reply {
    let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return err("value is not an integer or out of range");
    };
    let with_scores = matches!(args.get(3), Some(flag) if flag.eq_ignore_ascii_case(b"WITHSCORES"));
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return Reply::empty_array(),
        Err(reply) => return reply,
    };
    members_reply(set.range_by_rank(start, stop, desc), with_scores)
}

struct ScoreQuery {
    min: ScoreBorder,
    max: ScoreBorder,
    offset: u64,
    limit: Option<u64>,
    with_scores: bool,
}

fn parse_score_query(min_tok: &[u8], max_tok: &[u8], rest: &[Vec<u8>]) -> Result<ScoreQuery, Reply> {
    let Some(min) = ScoreBorder::parse(&String::from_utf8_lossy(min_tok)) else {
        return Err(err("min or max is not a float"));
    };
    let Some(max) = ScoreBorder::parse(&String::from_utf8_lossy(max_tok)) else {
        return Err(err("min or max is not a float"));
    };
    let mut with_scores = false;
    let mut offset = 0u64;
    let mut limit = None;
    let mut i = 0;
    while i < rest.len() {
        let token = String::from_utf8_lossy(&rest[i]).to_ascii_uppercase();
        match token.as_str() {
            "WITHSCORES" => {
                with_scores = true;
                i += 1;
            }
            "LIMIT" => {
                let (Some(raw_off), Some(raw_count)) = (rest.get(i + 1), rest.get(i + 2)) else {
                    return Err(err("syntax error"));
                };
                let (Some(off), Some(count)) = (parse_i64(raw_off), parse_i64(raw_count)) else {
                    return Err(err("value is not an integer or out of range"));
                };
                offset = off.max(0) as u64;
                limit = if count < 0 { None } else { Some(count as u64) };
                i += 3;
            }
            other => return Err(err(format!("syntax error near '{other}'"))),
        }
    }
    Ok(ScoreQuery { min, max, offset, limit, with_scores })
}

fn exec_zrangebyscore(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    zrange_by_score(db, lock, args, false)
}

fn exec_zrevrangebyscore(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    zrange_by_score(db, lock, args, true)
}

fn zrange_by_score(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>], desc: bool) -> Reply {
    // ZREVRANGEBYSCORE takes (max, min) on the wire; ZRANGEBYSCORE takes (min, max).
    let (min_tok, max_tok) = if desc { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
    let query = match parse_score_query(min_tok, max_tok, &args[3..]) {
        Ok(q) => q,
        Err(reply) => return reply,
    };
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return Reply::empty_array(),
        Err(reply) => return reply,
    };
    members_reply(set.range_by_score(&query.min, &query.max, query.offset, query.limit, desc), query.with_scores)
}

fn exec_zrangebylex(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let Some(min) = LexBorder::parse(&args[1]) else {
        return err("min or max not valid string range item");
    };
    let Some(max) = LexBorder::parse(&args[2]) else {
        return err("min or max not valid string range item");
    };
    let mut offset = 0u64;
    let mut limit = None;
    let mut i = 3;
    while i < args.len() {
        let token = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match token.as_str() {
            "LIMIT" => {
                let (Some(raw_off), Some(raw_count)) = (args.get(i + 1), args.get(i + 2)) else {
                    return err("syntax error");
                };
                let (Some(off), Some(count)) = (parse_i64(raw_off), parse_i64(raw_count)) else {
                    return err("value is not an integer or out of range");
                };
                offset = off.max(0) as u64;
                limit = if count < 0 { None } else { Some(count as u64) };
                i += 3;
            }
            other => return err(format!("syntax error near '{other}'")),
        }
    }
    let set = match read_zset(db, lock, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return Reply::empty_array(),
        Err(reply) => return reply,
    };
    members_reply(set.range_by_lex(&min, &max, offset, limit, false), false)
}

fn exec_zpopmin(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let count = match args.get(1) {
        Some(raw) => match parse_i64(raw) {
            Some(n) if n >= 0 => n as u64,
            _ => return err("value is out of range, must be positive"),
        },
        None => 1,
    };
    let key = &args[0];
    if live_entry(db, lock, key).is_none() {
        return Reply::empty_array();
    }
    let set = match lock.get_mut(key).unwrap().as_sorted_set_mut() {
        Ok(set) => set,
        Err(e) => return Reply::from(e),
    };
    let popped = set.pop_min(count);
    let empty_after = set.is_empty();
    if empty_after {
        lock.delete(key);
    }
    members_reply(popped, true)
}

fn exec_zrem(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    if live_entry(db, lock, key).is_none() {
        return Reply::Integer(0);
    }
    let set = match lock.get_mut(key).unwrap().as_sorted_set_mut() {
        Ok(set) => set,
        Err(e) => return Reply::from(e),
    };
    let mut removed = 0i64;
    for member in &args[1..] {
        if set.remove(member) {
            removed += 1;
        }
    }
    let empty_after = set.is_empty();
    if empty_after {
        lock.delete(key);
    }
    Reply::Integer(removed)
}

fn exec_zremrangebyscore(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    let Some(min) = ScoreBorder::parse(&String::from_utf8_lossy(&args[1])) else {
        return err("min or max is not a float");
    };
    let Some(max) = ScoreBorder::parse(&String::from_utf8_lossy(&args[2])) else {
        return err("min or max is not a float");
    };
    if live_entry(db, lock, key).is_none() {
        return Reply::Integer(0);
    }
    let set = match lock.get_mut(key).unwrap().as_sorted_set_mut() {
        Ok(set) => set,
        Err(e) => return Reply::from(e),
    };
    let removed = set.remove_range_by_score(&min, &max);
    let empty_after = set.is_empty();
    if empty_after {
        lock.delete(key);
    }
    Reply::Integer(removed.len() as i64)
}

fn exec_zremrangebyrank(db: &Arc<Database>, lock: &mut MultiKeyLock<'_, DataEntity>, args: &[Vec<u8>]) -> Reply {
    let key = &args[0];
    let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return err("value is not an integer or out of range");
    };
    if live_entry(db, lock, key).is_none() {
        return Reply::Integer(0);
    }
    let set = match lock.get_mut(key).unwrap().as_sorted_set_mut() {
        Ok(set) => set,
        Err(e) => return Reply::from(e),
    };
    let removed = set.remove_range_by_rank(start, stop);
    let empty_after = set.is_empty();
    if empty_after {
        lock.delete(key);
    }
    Reply::Integer(removed.len() as i64)
}
