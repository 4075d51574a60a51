//! Command Implementations
//!
//! Each submodule registers its commands into the [`CommandTable`]. The
//! database engine only sees the table entries; it never looks inside a
//! command body.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ CommandParser   │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Db::exec        │  (db module: auth, MULTI/EXEC, locking)
//! └────────┬────────┘
//!          │  CommandTable lookup
//!          ▼
//! ┌─────────────────┐
//! │ executor        │  (this module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Dict / TTL / AOF│
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### Key Commands
//! - `DEL`, `EXISTS`, `TYPE`, `KEYS`
//! - `EXPIRE`, `PEXPIRE`, `EXPIREAT`, `PEXPIREAT`
//! - `TTL`, `PTTL`, `PERSIST`
//!
//! ### String Commands
//! - `SET`, `SETNX`, `SETEX`, `GET`, `GETSET`
//! - `INCR`, `INCRBY`, `DECR`, `DECRBY`
//! - `APPEND`, `STRLEN`, `MSET`, `MGET`
//!
//! ### List Commands
//! - `LPUSH`, `LPUSHX`, `RPUSH`, `RPUSHX`, `LPOP`, `RPOP`, `RPOPLPUSH`
//! - `LLEN`, `LINDEX`, `LRANGE`, `LSET`, `LREM`
//!
//! ### Hash Commands
//! - `HSET`, `HSETNX`, `HMSET`, `HGET`, `HEXISTS`, `HDEL`, `HLEN`, `HGETALL`
//!
//! ### Set Commands
//! - `SADD`, `SREM`, `SISMEMBER`, `SCARD`, `SMEMBERS`
//! - `SINTER`, `SUNION`, `SDIFF`, `SINTERSTORE`, `SUNIONSTORE`, `SDIFFSTORE`
//!
//! ### Server Commands
//! - `PING`, `ECHO`, `DBSIZE`, `FLUSHDB`
//!
//! Every write command logs itself to the append-only file only when it
//! changed something, and every write command has an undo generator.

pub mod hash;
pub mod keys;
pub mod list;
pub mod server;
pub mod set;
pub mod string;

use crate::db::marshal::unix_millis;
use crate::db::registry::CommandTable;
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors a command body can return. Each becomes an error reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR {0}")]
    Other(String),
}

impl From<CommandError> for Reply {
    fn from(e: CommandError) -> Self {
        Reply::Error(e.to_string())
    }
}

pub type CommandResult = Result<Reply, CommandError>;

/// Registers every built-in command.
pub fn register_all(table: &mut CommandTable) {
    keys::register(table);
    string::register(table);
    list::register(table);
    hash::register(table);
    set::register(table);
    server::register(table);
}

// ============================================================================
// Helpers shared by command bodies
// ============================================================================

pub(crate) fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

/// Absolute deadline from unix milliseconds. Negative values clamp to the
/// epoch, which is always in the past.
pub(crate) fn time_from_millis(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

/// Current time truncated to whole milliseconds, so a deadline written to
/// the log as `PEXPIREAT` replays to the identical value.
pub(crate) fn now_millis() -> i64 {
    unix_millis(SystemTime::now())
}

/// Appends `name args...` to the log.
pub(crate) fn log_command(db: &Db, name: &'static str, args: &[Bytes]) {
    let mut line: CmdLine = Vec::with_capacity(args.len() + 1);
    line.push(Bytes::from_static(name.as_bytes()));
    line.extend(args.iter().cloned());
    db.add_aof(line);
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::{CommandTable, Db, Session};
    use crate::protocol::{cmd_line, Reply};
    use std::sync::Arc;

    pub fn db() -> Arc<Db> {
        Db::replica(Arc::new(CommandTable::builtin()))
    }

    pub fn run(db: &Db, parts: &[&str]) -> Reply {
        db.exec(&mut Session::new(), &cmd_line(parts.iter().copied()))
    }

    pub fn bulk(s: &str) -> Reply {
        Reply::bulk(bytes::Bytes::from(s.to_string()))
    }

    pub fn bulks(items: &[&str]) -> Reply {
        Reply::bulks(items.iter().map(|s| bytes::Bytes::from(s.to_string())))
    }
}
