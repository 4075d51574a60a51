//! Hash commands.
//!
//! Undo works per field: only the fields a command touches are restored,
//! so a transaction never rewrites a whole hash to put back one field.

use super::{log_command, CommandError, CommandResult};
use crate::db::registry::{read_first_key, rollback_first_key, write_first_key, CommandTable};
use crate::db::marshal::expire_at_cmd;
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use crate::storage::DataValue;
use bytes::Bytes;
use std::collections::HashMap;

pub fn register(table: &mut CommandTable) {
    table.register("HSET", hset, Some(write_first_key), Some(undo_hset), -4);
    table.register("HMSET", hmset, Some(write_first_key), Some(undo_hset), -4);
    table.register("HSETNX", hsetnx, Some(write_first_key), Some(undo_hset), 4);
    table.register("HDEL", hdel, Some(write_first_key), Some(undo_hdel), -3);
    table.register("HGET", hget, Some(read_first_key), None, 3);
    table.register("HEXISTS", hexists, Some(read_first_key), None, 3);
    table.register("HLEN", hlen, Some(read_first_key), None, 2);
    table.register("HGETALL", hgetall, Some(read_first_key), None, 2);
}

type Fields = HashMap<Bytes, Bytes>;

fn hash_ref<R>(db: &Db, key: &[u8], f: impl FnOnce(&Fields) -> R) -> Result<Option<R>, CommandError> {
    db.with_entity(key, |value| match value {
        DataValue::Hash(fields) => Ok(f(fields)),
        _ => Err(CommandError::WrongType),
    })
    .transpose()
}

/// Applies `f` to the hash at `key`, creating it when `create` is set.
/// An emptied hash is removed.
fn hash_mut<R>(
    db: &Db,
    key: &Bytes,
    create: bool,
    f: impl FnOnce(&mut Fields) -> R,
) -> Result<Option<R>, CommandError> {
    let mut f = Some(f);
    let out = db
        .with_entity_mut(key, |value| match value {
            DataValue::Hash(fields) => {
                let out = f.take().map(|f| f(&mut *fields));
                Ok((out, fields.is_empty()))
            }
            _ => Err(CommandError::WrongType),
        })
        .transpose()?;

    match out {
        Some((out, empty)) => {
            if empty {
                db.remove(key);
            }
            Ok(out)
        }
        None if create => {
            let mut fields = Fields::new();
            let out = f.take().map(|f| f(&mut fields));
            if !fields.is_empty() {
                db.put_entity(key.clone(), DataValue::Hash(fields));
            }
            Ok(out)
        }
        None => Ok(None),
    }
}

fn check_pairs(args: &[Bytes], name: &str) -> Result<(), CommandError> {
    if args.len() < 3 || args.len() % 2 == 0 {
        return Err(CommandError::WrongArity(name.to_string()));
    }
    Ok(())
}

fn set_fields(db: &Db, args: &[Bytes]) -> Result<usize, CommandError> {
    let added = hash_mut(db, &args[0], true, |fields| {
        args[1..]
            .chunks_exact(2)
            .filter(|pair| fields.insert(pair[0].clone(), pair[1].clone()).is_none())
            .count()
    })?;
    Ok(added.unwrap_or(0))
}

/// HSET key field value [field value ...]
///
/// Replies the number of fields that were added.
fn hset(db: &Db, args: &[Bytes]) -> CommandResult {
    check_pairs(args, "hset")?;
    let added = set_fields(db, args)?;
    log_command(db, "HSET", args);
    Ok(Reply::integer(added as i64))
}

fn hmset(db: &Db, args: &[Bytes]) -> CommandResult {
    check_pairs(args, "hmset")?;
    set_fields(db, args)?;
    log_command(db, "HSET", args);
    Ok(Reply::ok())
}

/// HSETNX key field value
fn hsetnx(db: &Db, args: &[Bytes]) -> CommandResult {
    let (field, value) = (&args[1], &args[2]);
    let added = hash_mut(db, &args[0], true, |fields| {
        if fields.contains_key(field) {
            false
        } else {
            fields.insert(field.clone(), value.clone());
            true
        }
    })?
    .unwrap_or(false);

    if added {
        log_command(db, "HSET", args);
    }
    Ok(Reply::integer(added as i64))
}

/// HDEL key field [field ...]
fn hdel(db: &Db, args: &[Bytes]) -> CommandResult {
    let removed = hash_mut(db, &args[0], false, |fields| {
        args[1..]
            .iter()
            .filter(|field| fields.remove(*field).is_some())
            .count()
    })?
    .unwrap_or(0);

    if removed > 0 {
        log_command(db, "HDEL", args);
    }
    Ok(Reply::integer(removed as i64))
}

fn hget(db: &Db, args: &[Bytes]) -> CommandResult {
    let value = hash_ref(db, &args[0], |fields| fields.get(&args[1]).cloned())?.flatten();
    Ok(value.map_or_else(Reply::null_bulk, Reply::bulk))
}

fn hexists(db: &Db, args: &[Bytes]) -> CommandResult {
    let found = hash_ref(db, &args[0], |fields| fields.contains_key(&args[1]))?.unwrap_or(false);
    Ok(Reply::integer(found as i64))
}

fn hlen(db: &Db, args: &[Bytes]) -> CommandResult {
    let len = hash_ref(db, &args[0], |fields| fields.len())?.unwrap_or(0);
    Ok(Reply::integer(len as i64))
}

/// Field, value, field, value, ... in no particular order.
fn hgetall(db: &Db, args: &[Bytes]) -> CommandResult {
    let flat = hash_ref(db, &args[0], |fields| {
        fields
            .iter()
            .flat_map(|(field, value)| [field.clone(), value.clone()])
            .collect::<Vec<_>>()
    })?
    .unwrap_or_default();
    Ok(Reply::bulks(flat))
}

// ============================================================================
// Undo
// ============================================================================

/// `HSET key field old` for each field that exists, `HDEL key field` for the
/// rest. A missing key is undone with `DEL`.
fn undo_fields<'a>(db: &Db, key: &Bytes, touched: impl Iterator<Item = &'a Bytes>) -> Vec<CmdLine> {
    let snapshot = match hash_ref(db, key, |fields| {
        touched
            .map(|field| (field.clone(), fields.get(field).cloned()))
            .collect::<Vec<_>>()
    }) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return vec![vec![Bytes::from_static(b"DEL"), key.clone()]],
        // The command itself will fail on the type, so restore everything.
        Err(_) => return rollback_first_key(db, std::slice::from_ref(key)),
    };

    let mut lines: Vec<CmdLine> = snapshot
        .into_iter()
        .map(|(field, old)| match old {
            Some(value) => vec![Bytes::from_static(b"HSET"), key.clone(), field, value],
            None => vec![Bytes::from_static(b"HDEL"), key.clone(), field],
        })
        .collect();
    // HDEL of the last field drops the key and its TTL with it.
    if let Some(at) = db.ttl_at(key) {
        lines.push(expire_at_cmd(key, at));
    }
    lines
}

fn undo_hset(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    undo_fields(db, &args[0], args[1..].iter().step_by(2))
}

fn undo_hdel(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    undo_fields(db, &args[0], args[1..].iter())
}
