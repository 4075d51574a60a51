//! Server commands.

use super::{log_command, CommandError, CommandResult};
use crate::db::registry::{no_keys, CommandTable};
use crate::db::Db;
use crate::protocol::Reply;
use bytes::Bytes;

pub fn register(table: &mut CommandTable) {
    table.register("PING", ping, Some(no_keys), None, -1);
    table.register("ECHO", echo, Some(no_keys), None, 2);
    table.register("DBSIZE", dbsize, None, None, 1);
    table.register("FLUSHDB", flushdb, None, None, 1);
}

/// PING [message]
fn ping(_db: &Db, args: &[Bytes]) -> CommandResult {
    match args {
        [] => Ok(Reply::pong()),
        [message] => Ok(Reply::bulk(message.clone())),
        _ => Err(CommandError::WrongArity("ping".to_string())),
    }
}

fn echo(_db: &Db, args: &[Bytes]) -> CommandResult {
    Ok(Reply::bulk(args[0].clone()))
}

fn dbsize(db: &Db, _args: &[Bytes]) -> CommandResult {
    Ok(Reply::integer(db.len() as i64))
}

fn flushdb(db: &Db, args: &[Bytes]) -> CommandResult {
    db.flush();
    log_command(db, "FLUSHDB", args);
    Ok(Reply::ok())
}
