//! String commands.

use super::{log_command, now_millis, parse_int, time_from_millis, CommandError, CommandResult};
use crate::db::marshal::expire_at_cmd;
use crate::db::registry::{
    read_all_keys, read_first_key, rollback_first_key, rollback_given_keys, write_first_key,
    CommandTable,
};
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use crate::storage::DataValue;
use bytes::{Bytes, BytesMut};

pub fn register(table: &mut CommandTable) {
    table.register("SET", set, Some(write_first_key), Some(rollback_first_key), -3);
    table.register("SETNX", setnx, Some(write_first_key), Some(rollback_first_key), 3);
    table.register("SETEX", setex, Some(write_first_key), Some(rollback_first_key), 4);
    table.register("GET", get, Some(read_first_key), None, 2);
    table.register("GETSET", getset, Some(write_first_key), Some(rollback_first_key), 3);
    table.register("INCR", incr, Some(write_first_key), Some(rollback_first_key), 2);
    table.register("INCRBY", incrby, Some(write_first_key), Some(rollback_first_key), 3);
    table.register("DECR", decr, Some(write_first_key), Some(rollback_first_key), 2);
    table.register("DECRBY", decrby, Some(write_first_key), Some(rollback_first_key), 3);
    table.register("APPEND", append, Some(write_first_key), Some(rollback_first_key), 3);
    table.register("STRLEN", strlen, Some(read_first_key), None, 2);
    table.register("MSET", mset, Some(mset_keys), Some(undo_mset), -3);
    table.register("MGET", mget, Some(read_all_keys), None, -2);
}

/// The string stored at `key`, `None` if absent, an error for other types.
fn string_of(db: &Db, key: &[u8]) -> Result<Option<Bytes>, CommandError> {
    db.with_entity(key, |value| match value {
        DataValue::String(data) => Ok(data.clone()),
        _ => Err(CommandError::WrongType),
    })
    .transpose()
}

fn set_line(key: &Bytes, value: &Bytes) -> CmdLine {
    vec![Bytes::from_static(b"SET"), key.clone(), value.clone()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Upsert,
    IfAbsent,
    IfExists,
}

/// SET key value [NX|XX] [EX seconds|PX milliseconds]
fn set(db: &Db, args: &[Bytes]) -> CommandResult {
    let key = &args[0];
    let value = &args[1];

    let mut policy = Policy::Upsert;
    let mut ttl_ms: Option<i64> = None;

    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "NX" if policy != Policy::IfExists => policy = Policy::IfAbsent,
            "XX" if policy != Policy::IfAbsent => policy = Policy::IfExists,
            "EX" | "PX" if ttl_ms.is_none() => {
                i += 1;
                let amount = parse_int(args.get(i).ok_or(CommandError::Syntax)?)?;
                let invalid = || CommandError::InvalidExpire("set".to_string());
                if amount <= 0 {
                    return Err(invalid());
                }
                ttl_ms = Some(if opt == "EX" {
                    amount.checked_mul(1000).ok_or_else(invalid)?
                } else {
                    amount
                });
            }
            _ => return Err(CommandError::Syntax),
        }
        i += 1;
    }

    let entity = DataValue::String(value.clone());
    let applied = match policy {
        Policy::Upsert => {
            db.put_entity(key.clone(), entity);
            1
        }
        Policy::IfAbsent => db.put_if_absent(key.clone(), entity),
        Policy::IfExists => db.put_if_exists(key.clone(), entity),
    };
    if applied == 0 {
        return Ok(Reply::null_bulk());
    }

    db.add_aof(set_line(key, value));
    match ttl_ms {
        Some(ms) => {
            let at = time_from_millis(now_millis().saturating_add(ms));
            db.expire(key, at);
            db.add_aof(expire_at_cmd(key, at));
        }
        None => {
            db.persist(key);
        }
    }
    Ok(Reply::ok())
}

/// SETNX key value
fn setnx(db: &Db, args: &[Bytes]) -> CommandResult {
    let (key, value) = (&args[0], &args[1]);
    let created = db.put_if_absent(key.clone(), DataValue::String(value.clone()));
    if created > 0 {
        db.add_aof(set_line(key, value));
    }
    Ok(Reply::integer(created as i64))
}

/// SETEX key seconds value
fn setex(db: &Db, args: &[Bytes]) -> CommandResult {
    let (key, value) = (&args[0], &args[2]);
    let secs = parse_int(&args[1])?;
    let invalid = || CommandError::InvalidExpire("setex".to_string());
    if secs <= 0 {
        return Err(invalid());
    }
    let ms = secs.checked_mul(1000).ok_or_else(invalid)?;

    db.put_entity(key.clone(), DataValue::String(value.clone()));
    let at = time_from_millis(now_millis().saturating_add(ms));
    db.expire(key, at);

    db.add_aof(set_line(key, value));
    db.add_aof(expire_at_cmd(key, at));
    Ok(Reply::ok())
}

fn get(db: &Db, args: &[Bytes]) -> CommandResult {
    Ok(match string_of(db, &args[0])? {
        Some(data) => Reply::bulk(data),
        None => Reply::null_bulk(),
    })
}

/// GETSET key value
///
/// Replies the old value and drops any TTL.
fn getset(db: &Db, args: &[Bytes]) -> CommandResult {
    let (key, value) = (&args[0], &args[1]);
    let old = string_of(db, key)?;

    db.put_entity(key.clone(), DataValue::String(value.clone()));
    db.persist(key);
    db.add_aof(set_line(key, value));

    Ok(old.map_or_else(Reply::null_bulk, Reply::bulk))
}

/// Adds `delta` to the integer at `key`, creating it at 0. The TTL is kept.
fn incr_by(db: &Db, key: &Bytes, delta: i64) -> CommandResult {
    let current = match string_of(db, key)? {
        Some(data) => parse_int(&data)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;

    db.put_entity(key.clone(), DataValue::String(Bytes::from(next.to_string())));
    log_command(db, "INCRBY", &[key.clone(), Bytes::from(delta.to_string())]);
    Ok(Reply::integer(next))
}

fn incr(db: &Db, args: &[Bytes]) -> CommandResult {
    incr_by(db, &args[0], 1)
}

fn incrby(db: &Db, args: &[Bytes]) -> CommandResult {
    incr_by(db, &args[0], parse_int(&args[1])?)
}

fn decr(db: &Db, args: &[Bytes]) -> CommandResult {
    incr_by(db, &args[0], -1)
}

fn decrby(db: &Db, args: &[Bytes]) -> CommandResult {
    let delta = parse_int(&args[1])?
        .checked_neg()
        .ok_or(CommandError::Overflow)?;
    incr_by(db, &args[0], delta)
}

/// APPEND key value
fn append(db: &Db, args: &[Bytes]) -> CommandResult {
    let (key, value) = (&args[0], &args[1]);
    let current = string_of(db, key)?.unwrap_or_default();

    let mut joined = BytesMut::with_capacity(current.len() + value.len());
    joined.extend_from_slice(&current);
    joined.extend_from_slice(value);
    let len = joined.len();

    db.put_entity(key.clone(), DataValue::String(joined.freeze()));
    log_command(db, "APPEND", args);
    Ok(Reply::integer(len as i64))
}

fn strlen(db: &Db, args: &[Bytes]) -> CommandResult {
    let len = string_of(db, &args[0])?.map_or(0, |data| data.len());
    Ok(Reply::integer(len as i64))
}

/// Keys sit at even positions of `MSET k1 v1 k2 v2 ...`.
fn mset_keys(args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    (args.iter().step_by(2).cloned().collect(), Vec::new())
}

fn undo_mset(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, args.iter().step_by(2))
}

fn mset(db: &Db, args: &[Bytes]) -> CommandResult {
    if args.len() % 2 != 0 {
        return Err(CommandError::WrongArity("mset".to_string()));
    }
    for pair in args.chunks_exact(2) {
        db.put_entity(pair[0].clone(), DataValue::String(pair[1].clone()));
        db.persist(&pair[0]);
    }
    log_command(db, "MSET", args);
    Ok(Reply::ok())
}

/// MGET key [key ...]
///
/// Missing keys and keys of other types both read as nil.
fn mget(db: &Db, args: &[Bytes]) -> CommandResult {
    let values = args
        .iter()
        .map(|key| match string_of(db, key) {
            Ok(Some(data)) => Reply::bulk(data),
            _ => Reply::null_bulk(),
        })
        .collect();
    Ok(Reply::multi_bulk(values))
}
