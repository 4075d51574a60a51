//! Keyspace commands: deletion, existence, type and expiration.

use super::{log_command, now_millis, parse_int, time_from_millis, CommandError, CommandResult};
use crate::db::marshal::{expire_at_cmd, ttl_cmd};
use crate::db::registry::{
    read_all_keys, read_first_key, rollback_first_key, rollback_given_keys, write_all_keys,
    write_first_key, CommandTable,
};
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use bytes::Bytes;
use std::time::SystemTime;

pub fn register(table: &mut CommandTable) {
    table.register("DEL", del, Some(write_all_keys), Some(undo_del), -2);
    table.register("EXISTS", exists, Some(read_all_keys), None, -2);
    table.register("TYPE", key_type, Some(read_first_key), None, 2);
    table.register("KEYS", keys, None, None, 2);

    table.register("EXPIRE", expire, Some(write_first_key), Some(undo_expire), 3);
    table.register("PEXPIRE", pexpire, Some(write_first_key), Some(undo_pexpire), 3);
    table.register("EXPIREAT", expireat, Some(write_first_key), Some(undo_expireat), 3);
    table.register("PEXPIREAT", pexpireat, Some(write_first_key), Some(undo_pexpireat), 3);
    table.register("PERSIST", persist, Some(write_first_key), Some(undo_persist), 2);
    table.register("TTL", ttl, Some(read_first_key), None, 2);
    table.register("PTTL", pttl, Some(read_first_key), None, 2);
}

/// DEL key [key ...]
fn del(db: &Db, args: &[Bytes]) -> CommandResult {
    let deleted = db.removes(args);
    if deleted > 0 {
        log_command(db, "DEL", args);
    }
    Ok(Reply::integer(deleted as i64))
}

fn undo_del(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, args)
}

/// EXISTS key [key ...]
///
/// A key named twice is counted twice.
fn exists(db: &Db, args: &[Bytes]) -> CommandResult {
    let count = args.iter().filter(|key| db.contains(key)).count();
    Ok(Reply::integer(count as i64))
}

fn key_type(db: &Db, args: &[Bytes]) -> CommandResult {
    let name = db
        .with_entity(&args[0], |value| value.type_name())
        .unwrap_or("none");
    Ok(Reply::status(name))
}

/// KEYS pattern
fn keys(db: &Db, args: &[Bytes]) -> CommandResult {
    let pattern = GlobPattern::new(&args[0]);
    Ok(Reply::bulks(
        db.keys().into_iter().filter(|key| pattern.matches(key)),
    ))
}

// ============================================================================
// Expiration
// ============================================================================

#[derive(Clone, Copy)]
enum Unit {
    Seconds,
    Millis,
}

/// Deadline in unix milliseconds named by an expire command argument.
fn deadline_millis(arg: &[u8], name: &str, unit: Unit, absolute: bool) -> Result<i64, CommandError> {
    let amount = parse_int(arg)?;
    let invalid = || CommandError::InvalidExpire(name.to_string());

    let millis = match unit {
        Unit::Seconds => amount.checked_mul(1000).ok_or_else(invalid)?,
        Unit::Millis => amount,
    };
    if absolute {
        Ok(millis)
    } else {
        now_millis().checked_add(millis).ok_or_else(invalid)
    }
}

/// Shared body of the four expire commands. The deadline is kept at
/// millisecond precision and always logged as `PEXPIREAT`.
fn expire_generic(db: &Db, args: &[Bytes], name: &str, unit: Unit, absolute: bool) -> CommandResult {
    let key = &args[0];
    let deadline = deadline_millis(&args[1], name, unit, absolute)?;

    if !db.contains(key) {
        return Ok(Reply::integer(0));
    }

    let at = time_from_millis(deadline);
    db.expire(key, at);
    db.add_aof(expire_at_cmd(key, at));
    if at <= SystemTime::now() {
        db.remove(key);
    }
    Ok(Reply::integer(1))
}

fn expire(db: &Db, args: &[Bytes]) -> CommandResult {
    expire_generic(db, args, "expire", Unit::Seconds, false)
}

fn pexpire(db: &Db, args: &[Bytes]) -> CommandResult {
    expire_generic(db, args, "pexpire", Unit::Millis, false)
}

fn expireat(db: &Db, args: &[Bytes]) -> CommandResult {
    expire_generic(db, args, "expireat", Unit::Seconds, true)
}

fn pexpireat(db: &Db, args: &[Bytes]) -> CommandResult {
    expire_generic(db, args, "pexpireat", Unit::Millis, true)
}

fn persist(db: &Db, args: &[Bytes]) -> CommandResult {
    let key = &args[0];
    if !db.contains(key) || !db.persist(key) {
        return Ok(Reply::integer(0));
    }
    log_command(db, "PERSIST", args);
    Ok(Reply::integer(1))
}

// A deadline already in the past deletes the key, so only then is the whole
// value needed to undo it.
fn undo_expire_generic(db: &Db, args: &[Bytes], unit: Unit, absolute: bool) -> Vec<CmdLine> {
    let key = &args[0];
    if !db.contains(key) {
        return Vec::new();
    }
    let deletes = deadline_millis(&args[1], "", unit, absolute)
        .is_ok_and(|deadline| deadline <= now_millis());
    if deletes {
        rollback_first_key(db, args)
    } else {
        undo_persist(db, args)
    }
}

fn undo_expire(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    undo_expire_generic(db, args, Unit::Seconds, false)
}

fn undo_pexpire(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    undo_expire_generic(db, args, Unit::Millis, false)
}

fn undo_expireat(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    undo_expire_generic(db, args, Unit::Seconds, true)
}

fn undo_pexpireat(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    undo_expire_generic(db, args, Unit::Millis, true)
}

fn undo_persist(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    let key = &args[0];
    if !db.contains(key) {
        return Vec::new();
    }
    vec![ttl_cmd(key, db.ttl_at(key))]
}

fn remaining_millis(db: &Db, key: &[u8]) -> i64 {
    if !db.contains(key) {
        return -2;
    }
    match db.ttl_at(key) {
        None => -1,
        Some(at) => at
            .duration_since(SystemTime::now())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
    }
}

fn ttl(db: &Db, args: &[Bytes]) -> CommandResult {
    let ms = remaining_millis(db, &args[0]);
    let secs = if ms < 0 { ms } else { (ms + 500) / 1000 };
    Ok(Reply::integer(secs))
}

fn pttl(db: &Db, args: &[Bytes]) -> CommandResult {
    Ok(Reply::integer(remaining_millis(db, &args[0])))
}

// ============================================================================
// Glob matching
// ============================================================================

/// Glob matcher for `KEYS`: `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\x`.
pub struct GlobPattern<'a> {
    pattern: &'a [u8],
}

impl<'a> GlobPattern<'a> {
    pub fn new(pattern: &'a [u8]) -> Self {
        Self { pattern }
    }

    /// Runs in `O(pattern.len() * text.len())`: on a mismatch only the
    /// most recent `*` is retried, one byte further along.
    pub fn matches(&self, text: &[u8]) -> bool {
        let pattern = self.pattern;
        let (mut p, mut t) = (0, 0);
        // Pattern index after the last `*`, and the text index it is
        // currently absorbing up to.
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            match pattern.get(p) {
                Some(b'*') => {
                    p += 1;
                    star = Some((p, t));
                    continue;
                }
                Some(_) => match Self::match_one(pattern, p, text[t]) {
                    // Unterminated class
                    None => return false,
                    Some((true, next)) => {
                        p = next;
                        t += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                },
                None => {}
            }

            let Some((after_star, absorbed)) = star else {
                return false;
            };
            p = after_star;
            t = absorbed + 1;
            star = Some((after_star, t));
        }

        pattern[p..].iter().all(|&c| c == b'*')
    }

    /// Matches the single-byte token at `pattern[p]` against `c`. Returns
    /// the outcome and the index of the next token.
    fn match_one(pattern: &[u8], p: usize, c: u8) -> Option<(bool, usize)> {
        match pattern[p] {
            b'?' => Some((true, p + 1)),
            b'[' => {
                let mut i = p + 1;
                let negate = pattern.get(i) == Some(&b'^');
                if negate {
                    i += 1;
                }

                let mut matched = false;
                while i < pattern.len() && pattern[i] != b']' {
                    if pattern[i] == b'\\' && i + 1 < pattern.len() {
                        i += 1;
                        matched |= pattern[i] == c;
                    } else if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
                        let (lo, hi) = (pattern[i].min(pattern[i + 2]), pattern[i].max(pattern[i + 2]));
                        matched |= (lo..=hi).contains(&c);
                        i += 2;
                    } else {
                        matched |= pattern[i] == c;
                    }
                    i += 1;
                }

                if i >= pattern.len() {
                    return None;
                }
                Some((matched != negate, i + 1))
            }
            b'\\' if p + 1 < pattern.len() => Some((pattern[p + 1] == c, p + 2)),
            literal => Some((literal == c, p + 1)),
        }
    }
}
