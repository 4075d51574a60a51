//! Set commands.
//!
//! The `*STORE` variants write their destination and only read their
//! sources, so a transaction locks the sources shared.

use super::{log_command, CommandError, CommandResult};
use crate::db::registry::{
    read_all_keys, read_first_key, rollback_first_key, write_first_key, write_first_read_rest,
    CommandTable,
};
use crate::db::marshal::expire_at_cmd;
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use crate::storage::DataValue;
use bytes::Bytes;
use std::collections::HashSet;

pub fn register(table: &mut CommandTable) {
    table.register("SADD", sadd, Some(write_first_key), Some(undo_sadd), -3);
    table.register("SREM", srem, Some(write_first_key), Some(undo_srem), -3);
    table.register("SISMEMBER", sismember, Some(read_first_key), None, 3);
    table.register("SCARD", scard, Some(read_first_key), None, 2);
    table.register("SMEMBERS", smembers, Some(read_first_key), None, 2);
    table.register("SINTER", sinter, Some(read_all_keys), None, -2);
    table.register("SUNION", sunion, Some(read_all_keys), None, -2);
    table.register("SDIFF", sdiff, Some(read_all_keys), None, -2);
    table.register(
        "SINTERSTORE",
        sinterstore,
        Some(write_first_read_rest),
        Some(rollback_first_key),
        -3,
    );
    table.register(
        "SUNIONSTORE",
        sunionstore,
        Some(write_first_read_rest),
        Some(rollback_first_key),
        -3,
    );
    table.register(
        "SDIFFSTORE",
        sdiffstore,
        Some(write_first_read_rest),
        Some(rollback_first_key),
        -3,
    );
}

type Members = HashSet<Bytes>;

fn set_ref<R>(db: &Db, key: &[u8], f: impl FnOnce(&Members) -> R) -> Result<Option<R>, CommandError> {
    db.with_entity(key, |value| match value {
        DataValue::Set(members) => Ok(f(members)),
        _ => Err(CommandError::WrongType),
    })
    .transpose()
}

fn set_mut<R>(db: &Db, key: &[u8], f: impl FnOnce(&mut Members) -> R) -> Result<Option<R>, CommandError> {
    let out = db
        .with_entity_mut(key, |value| match value {
            DataValue::Set(members) => {
                let out = f(members);
                Ok((out, members.is_empty()))
            }
            _ => Err(CommandError::WrongType),
        })
        .transpose()?;

    Ok(out.map(|(out, empty)| {
        if empty {
            db.remove(key);
        }
        out
    }))
}

/// SADD key member [member ...]
fn sadd(db: &Db, args: &[Bytes]) -> CommandResult {
    let key = &args[0];
    let members = &args[1..];

    let added = match set_mut(db, key, |set| {
        members.iter().filter(|m| set.insert((*m).clone())).count()
    })? {
        Some(added) => added,
        None => {
            let set: Members = members.iter().cloned().collect();
            let added = set.len();
            db.put_entity(key.clone(), DataValue::Set(set));
            added
        }
    };

    if added > 0 {
        log_command(db, "SADD", args);
    }
    Ok(Reply::integer(added as i64))
}

/// SREM key member [member ...]
fn srem(db: &Db, args: &[Bytes]) -> CommandResult {
    let removed = set_mut(db, &args[0], |set| {
        args[1..].iter().filter(|m| set.remove(*m)).count()
    })?
    .unwrap_or(0);

    if removed > 0 {
        log_command(db, "SREM", args);
    }
    Ok(Reply::integer(removed as i64))
}

fn sismember(db: &Db, args: &[Bytes]) -> CommandResult {
    let found = set_ref(db, &args[0], |set| set.contains(&args[1]))?.unwrap_or(false);
    Ok(Reply::integer(found as i64))
}

fn scard(db: &Db, args: &[Bytes]) -> CommandResult {
    let len = set_ref(db, &args[0], |set| set.len())?.unwrap_or(0);
    Ok(Reply::integer(len as i64))
}

fn smembers(db: &Db, args: &[Bytes]) -> CommandResult {
    let members = set_ref(db, &args[0], |set| set.iter().cloned().collect::<Vec<_>>())?
        .unwrap_or_default();
    Ok(Reply::bulks(members))
}

// ============================================================================
// Set algebra
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum SetOp {
    Inter,
    Union,
    Diff,
}

/// Combines the sets at `keys` left to right. Missing keys read as empty
/// sets; any key holding another type fails the whole command.
fn calculate(db: &Db, keys: &[Bytes], op: SetOp) -> Result<Members, CommandError> {
    let sets = keys
        .iter()
        .map(|key| set_ref(db, key, |set| set.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut sets = sets.into_iter();
    let mut result = sets.next().flatten().unwrap_or_default();
    for set in sets {
        match (op, set) {
            (SetOp::Inter, Some(set)) => result.retain(|m| set.contains(m)),
            (SetOp::Inter, None) => result.clear(),
            (SetOp::Union, set) => result.extend(set.into_iter().flatten()),
            (SetOp::Diff, Some(set)) => result.retain(|m| !set.contains(m)),
            (SetOp::Diff, None) => {}
        }
    }
    Ok(result)
}

/// Replaces `dest` with the result. An empty result deletes it.
fn store(db: &Db, args: &[Bytes], op: SetOp, name: &'static str) -> CommandResult {
    let dest = &args[0];
    let result = calculate(db, &args[1..], op)?;
    let len = result.len();

    db.remove(dest);
    if len > 0 {
        db.put_entity(dest.clone(), DataValue::Set(result));
    }
    log_command(db, name, args);
    Ok(Reply::integer(len as i64))
}

fn sinter(db: &Db, args: &[Bytes]) -> CommandResult {
    Ok(Reply::bulks(calculate(db, args, SetOp::Inter)?))
}

fn sunion(db: &Db, args: &[Bytes]) -> CommandResult {
    Ok(Reply::bulks(calculate(db, args, SetOp::Union)?))
}

fn sdiff(db: &Db, args: &[Bytes]) -> CommandResult {
    Ok(Reply::bulks(calculate(db, args, SetOp::Diff)?))
}

fn sinterstore(db: &Db, args: &[Bytes]) -> CommandResult {
    store(db, args, SetOp::Inter, "SINTERSTORE")
}

fn sunionstore(db: &Db, args: &[Bytes]) -> CommandResult {
    store(db, args, SetOp::Union, "SUNIONSTORE")
}

fn sdiffstore(db: &Db, args: &[Bytes]) -> CommandResult {
    store(db, args, SetOp::Diff, "SDIFFSTORE")
}

// ============================================================================
// Undo
// ============================================================================

/// Members of `candidates` whose presence in the set equals `present`.
/// `None` when the key is missing, `Err` when it is not a set.
fn partition(db: &Db, key: &[u8], candidates: &[Bytes], present: bool) -> Result<Option<Vec<Bytes>>, CommandError> {
    set_ref(db, key, |set| {
        let mut seen = HashSet::new();
        candidates
            .iter()
            .filter(|m| set.contains(*m) == present && seen.insert((*m).clone()))
            .cloned()
            .collect()
    })
}

fn member_line(name: &'static [u8], key: &Bytes, members: Vec<Bytes>) -> Vec<CmdLine> {
    if members.is_empty() {
        return Vec::new();
    }
    let mut line = Vec::with_capacity(members.len() + 2);
    line.push(Bytes::from_static(name));
    line.push(key.clone());
    line.extend(members);
    vec![line]
}

/// Removes exactly the members `SADD` will add.
fn undo_sadd(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    let key = &args[0];
    match partition(db, key, &args[1..], false) {
        Ok(Some(added)) => member_line(b"SREM", key, added),
        Ok(None) => vec![vec![Bytes::from_static(b"DEL"), key.clone()]],
        Err(_) => rollback_first_key(db, args),
    }
}

/// Puts back exactly the members `SREM` will remove.
fn undo_srem(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    let key = &args[0];
    match partition(db, key, &args[1..], true) {
        Ok(Some(removed)) => {
            let mut lines = member_line(b"SADD", key, removed);
            // Removing the last member drops the key and its TTL with it.
            if let (false, Some(at)) = (lines.is_empty(), db.ttl_at(key)) {
                lines.push(expire_at_cmd(key, at));
            }
            lines
        }
        Ok(None) => Vec::new(),
        Err(_) => rollback_first_key(db, args),
    }
}
