//! List commands.
//!
//! Lists are `VecDeque`s so both ends push and pop in constant time. A list
//! that becomes empty is removed from the keyspace.

use super::{log_command, parse_int, CommandError, CommandResult};
use crate::db::registry::{
    read_first_key, rollback_first_key, rollback_given_keys, write_all_keys, write_first_key,
    CommandTable,
};
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use crate::storage::DataValue;
use bytes::Bytes;
use std::collections::VecDeque;

pub fn register(table: &mut CommandTable) {
    table.register("LPUSH", lpush, Some(write_first_key), Some(rollback_first_key), -3);
    table.register("LPUSHX", lpushx, Some(write_first_key), Some(rollback_first_key), -3);
    table.register("RPUSH", rpush, Some(write_first_key), Some(rollback_first_key), -3);
    table.register("RPUSHX", rpushx, Some(write_first_key), Some(rollback_first_key), -3);
    table.register("LPOP", lpop, Some(write_first_key), Some(rollback_first_key), 2);
    table.register("RPOP", rpop, Some(write_first_key), Some(rollback_first_key), 2);
    table.register("RPOPLPUSH", rpoplpush, Some(write_all_keys), Some(undo_rpoplpush), 3);
    table.register("LLEN", llen, Some(read_first_key), None, 2);
    table.register("LINDEX", lindex, Some(read_first_key), None, 3);
    table.register("LRANGE", lrange, Some(read_first_key), None, 4);
    table.register("LSET", lset, Some(write_first_key), Some(rollback_first_key), 4);
    table.register("LREM", lrem, Some(write_first_key), Some(rollback_first_key), 4);
}

fn list_ref<R>(
    db: &Db,
    key: &[u8],
    f: impl FnOnce(&VecDeque<Bytes>) -> R,
) -> Result<Option<R>, CommandError> {
    db.with_entity(key, |value| match value {
        DataValue::List(list) => Ok(f(list)),
        _ => Err(CommandError::WrongType),
    })
    .transpose()
}

/// Mutates the list at `key` in place, dropping the key if it ends up empty.
fn list_mut<R>(
    db: &Db,
    key: &[u8],
    f: impl FnOnce(&mut VecDeque<Bytes>) -> R,
) -> Result<Option<R>, CommandError> {
    let out = db
        .with_entity_mut(key, |value| match value {
            DataValue::List(list) => {
                let out = f(list);
                Ok((out, list.is_empty()))
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

/// Resolves a possibly negative index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let actual = if index < 0 { len + index } else { index };
    (0..len).contains(&actual).then_some(actual as usize)
}

// ============================================================================
// Push / pop
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum End {
    Head,
    Tail,
}

fn push(db: &Db, args: &[Bytes], end: End, only_existing: bool, name: &'static str) -> CommandResult {
    let key = &args[0];
    let values = &args[1..];

    let len = list_mut(db, key, |list| {
        for value in values {
            match end {
                End::Head => list.push_front(value.clone()),
                End::Tail => list.push_back(value.clone()),
            }
        }
        list.len()
    })?;

    let len = match len {
        Some(len) => len,
        None if only_existing => return Ok(Reply::integer(0)),
        None => {
            let list: VecDeque<Bytes> = match end {
                End::Head => values.iter().rev().cloned().collect(),
                End::Tail => values.iter().cloned().collect(),
            };
            db.put_entity(key.clone(), DataValue::List(list));
            values.len()
        }
    };

    log_command(db, name, args);
    Ok(Reply::integer(len as i64))
}

fn lpush(db: &Db, args: &[Bytes]) -> CommandResult {
    push(db, args, End::Head, false, "LPUSH")
}

fn lpushx(db: &Db, args: &[Bytes]) -> CommandResult {
    push(db, args, End::Head, true, "LPUSHX")
}

fn rpush(db: &Db, args: &[Bytes]) -> CommandResult {
    push(db, args, End::Tail, false, "RPUSH")
}

fn rpushx(db: &Db, args: &[Bytes]) -> CommandResult {
    push(db, args, End::Tail, true, "RPUSHX")
}

fn pop(db: &Db, args: &[Bytes], end: End, name: &'static str) -> CommandResult {
    let popped = list_mut(db, &args[0], |list| match end {
        End::Head => list.pop_front(),
        End::Tail => list.pop_back(),
    })?
    .flatten();

    Ok(match popped {
        Some(value) => {
            log_command(db, name, args);
            Reply::bulk(value)
        }
        None => Reply::null_bulk(),
    })
}

fn lpop(db: &Db, args: &[Bytes]) -> CommandResult {
    pop(db, args, End::Head, "LPOP")
}

fn rpop(db: &Db, args: &[Bytes]) -> CommandResult {
    pop(db, args, End::Tail, "RPOP")
}

/// RPOPLPUSH source destination
fn rpoplpush(db: &Db, args: &[Bytes]) -> CommandResult {
    let (source, destination) = (&args[0], &args[1]);

    // Check the destination before anything is popped.
    list_ref(db, destination, |_| ())?;

    let Some(value) = list_mut(db, source, VecDeque::pop_back)?.flatten() else {
        return Ok(Reply::null_bulk());
    };

    let pushed = list_mut(db, destination, |list| list.push_front(value.clone()))?;
    if pushed.is_none() {
        db.put_entity(
            destination.clone(),
            DataValue::List(VecDeque::from([value.clone()])),
        );
    }

    log_command(db, "RPOPLPUSH", args);
    Ok(Reply::bulk(value))
}

fn undo_rpoplpush(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, args.iter().take(2))
}

// ============================================================================
// Reads
// ============================================================================

fn llen(db: &Db, args: &[Bytes]) -> CommandResult {
    let len = list_ref(db, &args[0], |list| list.len())?.unwrap_or(0);
    Ok(Reply::integer(len as i64))
}

/// LINDEX key index
fn lindex(db: &Db, args: &[Bytes]) -> CommandResult {
    let index = parse_int(&args[1])?;
    let value = list_ref(db, &args[0], |list| {
        resolve_index(index, list.len()).and_then(|i| list.get(i).cloned())
    })?
    .flatten();
    Ok(value.map_or_else(Reply::null_bulk, Reply::bulk))
}

/// LRANGE key start stop
///
/// Both ends are inclusive and negative indices count from the tail.
/// Out of range bounds are clamped.
fn lrange(db: &Db, args: &[Bytes]) -> CommandResult {
    let start = parse_int(&args[1])?;
    let stop = parse_int(&args[2])?;

    let items = list_ref(db, &args[0], |list| {
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

        if start > stop || start >= len {
            return Vec::new();
        }
        list.iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect()
    })?
    .unwrap_or_default();

    Ok(Reply::bulks(items))
}

// ============================================================================
// In-place edits
// ============================================================================

/// LSET key index value
fn lset(db: &Db, args: &[Bytes]) -> CommandResult {
    let index = parse_int(&args[1])?;
    let value = &args[2];

    list_mut(db, &args[0], |list| {
        let i = resolve_index(index, list.len()).ok_or(CommandError::IndexOutOfRange)?;
        list[i] = value.clone();
        Ok(())
    })?
    .ok_or(CommandError::NoSuchKey)??;

    log_command(db, "LSET", args);
    Ok(Reply::ok())
}

/// LREM key count value
///
/// - `count > 0`: remove up to `count` matches, head to tail
/// - `count < 0`: remove up to `|count|` matches, tail to head
/// - `count = 0`: remove every match
fn lrem(db: &Db, args: &[Bytes]) -> CommandResult {
    let count = parse_int(&args[1])?;
    let target = &args[2];
    let limit = if count == 0 {
        usize::MAX
    } else {
        count.unsigned_abs() as usize
    };

    let removed = list_mut(db, &args[0], |list| {
        let mut removed = 0usize;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == *target {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == *target {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        removed
    })?
    .unwrap_or(0);

    if removed > 0 {
        log_command(db, "LREM", args);
    }
    Ok(Reply::integer(removed as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{bulk, bulks, db, run};

    #[test]
    fn test_push_order() {
        let db = db();
        assert_eq!(run(&db, &["LPUSH", "l", "a", "b", "c"]), Reply::integer(3));
        assert_eq!(run(&db, &["RPUSH", "l", "x", "y"]), Reply::integer(5));
        assert_eq!(
            run(&db, &["LRANGE", "l", "0", "-1"]),
            bulks(&["c", "b", "a", "x", "y"])
        );
    }

    #[test]
    fn test_pushx_needs_existing_list() {
        let db = db();
        assert_eq!(run(&db, &["LPUSHX", "l", "a"]), Reply::integer(0));
        assert_eq!(run(&db, &["RPUSHX", "l", "a"]), Reply::integer(0));
        assert_eq!(run(&db, &["EXISTS", "l"]), Reply::integer(0));
        run(&db, &["RPUSH", "l", "a"]);
        assert_eq!(run(&db, &["LPUSHX", "l", "z"]), Reply::integer(2));
        assert_eq!(run(&db, &["RPUSHX", "l", "b"]), Reply::integer(3));
        assert_eq!(run(&db, &["LRANGE", "l", "0", "-1"]), bulks(&["z", "a", "b"]));
    }

    #[test]
    fn test_pop_removes_empty_list() {
        let db = db();
        run(&db, &["RPUSH", "l", "a", "b"]);
        assert_eq!(run(&db, &["LPOP", "l"]), bulk("a"));
        assert_eq!(run(&db, &["RPOP", "l"]), bulk("b"));
        assert_eq!(run(&db, &["LPOP", "l"]), Reply::null_bulk());
        assert_eq!(run(&db, &["TYPE", "l"]), Reply::status("none"));
        assert!(db.is_empty());
    }

    #[test]
    fn test_rpoplpush() {
        let db = db();
        run(&db, &["RPUSH", "src", "a", "b"]);
        assert_eq!(run(&db, &["RPOPLPUSH", "src", "dst"]), bulk("b"));
        assert_eq!(run(&db, &["RPOPLPUSH", "src", "dst"]), bulk("a"));
        assert_eq!(run(&db, &["RPOPLPUSH", "src", "dst"]), Reply::null_bulk());
        assert_eq!(run(&db, &["LRANGE", "dst", "0", "-1"]), bulks(&["a", "b"]));
        assert_eq!(run(&db, &["EXISTS", "src"]), Reply::integer(0));

        // Rotation onto itself.
        assert_eq!(run(&db, &["RPOPLPUSH", "dst", "dst"]), bulk("b"));
        assert_eq!(run(&db, &["LRANGE", "dst", "0", "-1"]), bulks(&["b", "a"]));
    }

    #[test]
    fn test_rpoplpush_wrong_type_destination_keeps_source() {
        let db = db();
        run(&db, &["RPUSH", "src", "a"]);
        run(&db, &["SET", "dst", "x"]);
        assert!(run(&db, &["RPOPLPUSH", "src", "dst"]).is_error());
        assert_eq!(run(&db, &["LLEN", "src"]), Reply::integer(1));
    }

    #[test]
    fn test_lindex() {
        let db = db();
        run(&db, &["RPUSH", "l", "a", "b", "c"]);
        assert_eq!(run(&db, &["LINDEX", "l", "0"]), bulk("a"));
        assert_eq!(run(&db, &["LINDEX", "l", "-1"]), bulk("c"));
        assert_eq!(run(&db, &["LINDEX", "l", "3"]), Reply::null_bulk());
        assert_eq!(run(&db, &["LINDEX", "l", "-4"]), Reply::null_bulk());
        assert_eq!(run(&db, &["LINDEX", "missing", "0"]), Reply::null_bulk());
    }

    #[test]
    fn test_lrange_clamps() {
        let db = db();
        run(&db, &["RPUSH", "l", "a", "b", "c", "d"]);
        assert_eq!(run(&db, &["LRANGE", "l", "1", "2"]), bulks(&["b", "c"]));
        assert_eq!(run(&db, &["LRANGE", "l", "-2", "100"]), bulks(&["c", "d"]));
        assert_eq!(run(&db, &["LRANGE", "l", "-100", "0"]), bulks(&["a"]));
        assert_eq!(run(&db, &["LRANGE", "l", "3", "1"]), Reply::empty_multi_bulk());
        assert_eq!(run(&db, &["LRANGE", "l", "10", "20"]), Reply::empty_multi_bulk());
        assert_eq!(run(&db, &["LRANGE", "l", "0", "-10"]), Reply::empty_multi_bulk());
        assert_eq!(
            run(&db, &["LRANGE", "missing", "0", "-1"]),
            Reply::empty_multi_bulk()
        );
    }

    #[test]
    fn test_lset() {
        let db = db();
        run(&db, &["RPUSH", "l", "a", "b", "c"]);
        assert_eq!(run(&db, &["LSET", "l", "1", "B"]), Reply::ok());
        assert_eq!(run(&db, &["LSET", "l", "-1", "C"]), Reply::ok());
        assert_eq!(run(&db, &["LRANGE", "l", "0", "-1"]), bulks(&["a", "B", "C"]));
        assert_eq!(
            run(&db, &["LSET", "l", "5", "x"]),
            Reply::error("ERR index out of range")
        );
        assert_eq!(
            run(&db, &["LSET", "missing", "0", "x"]),
            Reply::error("ERR no such key")
        );
    }

    #[test]
    fn test_lrem() {
        let db = db();
        run(&db, &["RPUSH", "l", "a", "b", "a", "c", "a"]);
        assert_eq!(run(&db, &["LREM", "l", "1", "a"]), Reply::integer(1));
        assert_eq!(
            run(&db, &["LRANGE", "l", "0", "-1"]),
            bulks(&["b", "a", "c", "a"])
        );
        assert_eq!(run(&db, &["LREM", "l", "-1", "a"]), Reply::integer(1));
        assert_eq!(run(&db, &["LRANGE", "l", "0", "-1"]), bulks(&["b", "a", "c"]));
        assert_eq!(run(&db, &["LREM", "l", "0", "a"]), Reply::integer(1));
        assert_eq!(run(&db, &["LREM", "l", "0", "zz"]), Reply::integer(0));

        run(&db, &["LREM", "l", "0", "b"]);
        run(&db, &["LREM", "l", "0", "c"]);
        assert_eq!(run(&db, &["EXISTS", "l"]), Reply::integer(0));
    }

    #[test]
    fn test_wrong_type() {
        let db = db();
        run(&db, &["SET", "s", "v"]);
        assert_eq!(
            run(&db, &["LPUSH", "s", "x"]),
            Reply::error("WRONGTYPE Operation against a key holding the wrong kind of value")
        );
        assert!(run(&db, &["LRANGE", "s", "0", "-1"]).is_error());
        assert!(run(&db, &["LLEN", "s"]).is_error());
    }

    #[test]
    fn test_resolve_index() {
        assert_eq!(resolve_index(0, 3), Some(0));
        assert_eq!(resolve_index(-1, 3), Some(2));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(-4, 3), None);
        assert_eq!(resolve_index(0, 0), None);
    }
}
