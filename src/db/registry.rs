//! Command Table
//!
//! Every command the engine can run is described by a [`Command`]:
//!
//! - `executor` runs the command body against the database
//! - `prepare` names the keys it writes and reads, so the engine can lock
//!   them (commands without one cannot be queued in a transaction)
//! - `undo` inspects the current state and returns the command lines that
//!   would reverse the command's effect
//! - `arity` is the exact argument count including the name, or `-n` for
//!   "at least n"
//!
//! The table is built once at startup and shared by the dispatcher and the
//! append-only log replay.

use crate::commands::{self, CommandError};
use crate::db::marshal::{entity_to_cmd, ttl_cmd};
use crate::db::Db;
use crate::protocol::{cmd_line, CmdLine, Reply};
use bytes::Bytes;
use std::collections::HashMap;

/// Runs a command. `args` excludes the command name.
pub type ExecFn = fn(&Db, &[Bytes]) -> Result<Reply, CommandError>;

/// Returns `(write_keys, read_keys)` for a command's arguments.
pub type PrepareFn = fn(&[Bytes]) -> (Vec<Bytes>, Vec<Bytes>);

/// Returns compensating command lines, executed first to last.
pub type UndoFn = fn(&Db, &[Bytes]) -> Vec<CmdLine>;

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub executor: ExecFn,
    pub prepare: Option<PrepareFn>,
    pub undo: Option<UndoFn>,
    pub arity: i32,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("queueable", &self.prepare.is_some())
            .field("undo", &self.undo.is_some())
            .finish()
    }
}

impl Command {
    /// Write and read keys, or none for commands without a key extractor.
    pub fn keys(&self, args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
        match self.prepare {
            Some(prepare) => prepare(args),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn undo_lines(&self, db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
        match self.undo {
            Some(undo) => undo(db, args),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandTable {
    commands: HashMap<String, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding every built-in command.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        commands::register_all(&mut table);
        table
    }

    pub fn register(
        &mut self,
        name: &'static str,
        executor: ExecFn,
        prepare: Option<PrepareFn>,
        undo: Option<UndoFn>,
        arity: i32,
    ) {
        self.commands.insert(
            name.to_ascii_lowercase(),
            Command {
                name,
                executor,
                prepare,
                undo,
                arity,
            },
        );
    }

    /// Looks up a command by its lowercase name.
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// `arity >= 0` means exactly `arity` parts, `arity < 0` at least `-arity`.
pub fn validate_arity(arity: i32, line: &[Bytes]) -> bool {
    let argc = line.len() as i64;
    let arity = arity as i64;
    if arity >= 0 {
        argc == arity
    } else {
        argc >= -arity
    }
}

/// Lowercase command name of a line.
pub fn command_name(line: &[Bytes]) -> String {
    line.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
        .unwrap_or_default()
}

// ============================================================================
// Key extractors
// ============================================================================

pub fn write_first_key(args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    (args.iter().take(1).cloned().collect(), Vec::new())
}

pub fn read_first_key(args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    (Vec::new(), args.iter().take(1).cloned().collect())
}

pub fn write_all_keys(args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    (args.to_vec(), Vec::new())
}

pub fn read_all_keys(args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    (Vec::new(), args.to_vec())
}

/// First argument is the destination, the rest are sources.
pub fn write_first_read_rest(args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    match args.split_first() {
        Some((dest, sources)) => (vec![dest.clone()], sources.to_vec()),
        None => (Vec::new(), Vec::new()),
    }
}

pub fn no_keys(_args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    (Vec::new(), Vec::new())
}

// ============================================================================
// Undo helpers
// ============================================================================

/// Lines restoring each key to its current state: `DEL` for an absent key,
/// otherwise `DEL`, the value rebuilt in one command, and its TTL.
pub fn rollback_given_keys<'a>(db: &Db, keys: impl IntoIterator<Item = &'a Bytes>) -> Vec<CmdLine> {
    let mut lines = Vec::new();
    for key in keys {
        lines.push(cmd_line([b"DEL".as_slice(), &key[..]]));
        if let Some(entity) = db.get_entity(key) {
            lines.push(entity_to_cmd(key, &entity));
            lines.push(ttl_cmd(key, db.ttl_at(key)));
        }
    }
    lines
}

pub fn rollback_first_key(db: &Db, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, args.iter().take(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(parts: &[&str]) -> CmdLine {
        cmd_line(parts.iter().copied())
    }

    #[test]
    fn test_validate_arity() {
        assert!(validate_arity(2, &line(&["get", "k"])));
        assert!(!validate_arity(2, &line(&["get"])));
        assert!(!validate_arity(2, &line(&["get", "a", "b"])));
        assert!(validate_arity(-3, &line(&["set", "k", "v"])));
        assert!(validate_arity(-3, &line(&["set", "k", "v", "ex", "10"])));
        assert!(!validate_arity(-3, &line(&["set", "k"])));
    }

    #[test]
    fn test_key_extractors() {
        let args = line(&["a", "b"]);
        assert_eq!(write_first_key(&args), (line(&["a"]), vec![]));
        assert_eq!(read_first_key(&args), (vec![], line(&["a"])));
        assert_eq!(write_all_keys(&args), (args.clone(), vec![]));
        assert_eq!(read_all_keys(&args), (vec![], args.clone()));
        assert_eq!(write_first_read_rest(&args), (line(&["a"]), line(&["b"])));
        assert_eq!(no_keys(&args), (vec![], vec![]));
    }

    #[test]
    fn test_builtin_table() {
        let table = CommandTable::builtin();
        assert!(!table.is_empty());
        let set = table.get("set").unwrap();
        assert_eq!(set.arity, -3);
        assert!(set.undo.is_some());
        assert!(table.get("SET").is_none());
        assert!(table.get("flushdb").unwrap().prepare.is_none());
    }

    #[test]
    fn test_command_name_lowercases() {
        assert_eq!(command_name(&line(&["GeT", "k"])), "get");
        assert_eq!(command_name(&[]), "");
    }
}
