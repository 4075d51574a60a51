//! Optimistic Transactions
//!
//! ```text
//!   WATCH k ──▶ snapshot version(k)
//!   MULTI   ──▶ queue commands (+QUEUED)
//!   EXEC    ──▶ lock union of all keys + watched keys
//!               ├─ any watched version changed? ──▶ *0 (nothing runs)
//!               └─ run queued commands in order, recording undo lines
//!                    ├─ all ok      ──▶ bump write versions, reply results
//!                    └─ one failed  ──▶ replay undo lines newest first,
//!                                        reply EXECABORT
//! ```
//!
//! Rollback is compensation, not isolation: each undo line is an ordinary
//! command computed from the state just before the queued command ran.

use crate::commands::CommandError;
use crate::db::registry::{command_name, validate_arity};
use crate::db::Db;
use crate::protocol::{CmdLine, Reply};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::warn;

pub const DISCARDED: &str = "EXECABORT Transaction discarded because of previous errors.";

/// Per-connection transaction state.
#[derive(Debug, Default)]
pub struct Session {
    multi: bool,
    queue: Vec<CmdLine>,
    watching: HashMap<Bytes, u64>,
    authenticated: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_multi(&self) -> bool {
        self.multi
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn set_authenticated(&mut self, value: bool) {
        self.authenticated = value;
    }
}

impl Db {
    pub(crate) fn start_multi(&self, session: &mut Session) -> Reply {
        if session.multi {
            return Reply::error("ERR MULTI calls can not be nested");
        }
        session.multi = true;
        Reply::ok()
    }

    pub(crate) fn discard_multi(&self, session: &mut Session) -> Reply {
        if !session.multi {
            return Reply::error("ERR DISCARD without MULTI");
        }
        session.multi = false;
        session.queue.clear();
        session.watching.clear();
        Reply::ok()
    }

    pub(crate) fn watch(&self, session: &mut Session, keys: &[Bytes]) -> Reply {
        if session.multi {
            return Reply::error("ERR WATCH inside MULTI is not allowed");
        }
        for key in keys {
            session
                .watching
                .insert(key.clone(), self.get_version(key));
        }
        Reply::ok()
    }

    pub(crate) fn unwatch(&self, session: &mut Session) -> Reply {
        session.watching.clear();
        Reply::ok()
    }

    /// Validates and queues one command while in MULTI.
    pub(crate) fn enqueue(&self, session: &mut Session, line: &[Bytes]) -> Reply {
        let name = command_name(line);
        let Some(cmd) = self.commands().get(&name) else {
            return CommandError::UnknownCommand(name).into();
        };
        if cmd.prepare.is_none() {
            return Reply::error(format!("ERR command '{}' cannot be used in MULTI", name));
        }
        if !validate_arity(cmd.arity, line) {
            return CommandError::WrongArity(name).into();
        }
        session.queue.push(line.to_vec());
        Reply::queued()
    }

    /// Leaves MULTI and runs the queue. The watch set is consumed whatever
    /// happens.
    pub(crate) fn exec_queued(&self, session: &mut Session) -> Reply {
        if !session.multi {
            return Reply::error("ERR EXEC without MULTI");
        }
        session.multi = false;
        let queue = std::mem::take(&mut session.queue);
        let watching = std::mem::take(&mut session.watching);
        self.exec_multi(&watching, &queue)
    }

    /// Runs `lines` as one transaction under a single batch lock.
    pub fn exec_multi(&self, watching: &HashMap<Bytes, u64>, lines: &[CmdLine]) -> Reply {
        let mut write_keys = Vec::new();
        let mut read_keys: Vec<Bytes> = watching.keys().cloned().collect();
        let mut plan = Vec::with_capacity(lines.len());

        for line in lines {
            let name = command_name(line);
            let Some(cmd) = self.commands().get(&name) else {
                return CommandError::UnknownCommand(name).into();
            };
            let (w, r) = cmd.keys(&line[1..]);
            write_keys.extend(w);
            read_keys.extend(r);
            plan.push(cmd);
        }

        let _guard = self.locks().lock_read_write(&write_keys, &read_keys);

        if watching
            .iter()
            .any(|(key, version)| self.get_version(key) != *version)
        {
            return Reply::empty_multi_bulk();
        }

        let mut results = Vec::with_capacity(lines.len());
        let mut undo_logs: Vec<Vec<CmdLine>> = Vec::with_capacity(lines.len());
        let mut aborted = false;

        for (line, cmd) in lines.iter().zip(plan) {
            let args = &line[1..];
            let undo = cmd.undo_lines(self, args);
            let reply = match (cmd.executor)(self, args) {
                Ok(reply) => reply,
                Err(e) => e.into(),
            };
            if reply.is_error() {
                aborted = true;
                break;
            }
            undo_logs.push(undo);
            results.push(reply);
        }

        if aborted {
            self.rollback(undo_logs);
            return Reply::error(DISCARDED);
        }

        self.add_version(&write_keys);
        Reply::multi_bulk(results)
    }

    // Newest command first; each command's own lines in order.
    fn rollback(&self, undo_logs: Vec<Vec<CmdLine>>) {
        for lines in undo_logs.into_iter().rev() {
            for line in lines {
                let name = command_name(&line);
                let Some(cmd) = self.commands().get(&name) else {
                    warn!(command = %name, "Unknown undo command");
                    continue;
                };
                if let Err(e) = (cmd.executor)(self, &line[1..]) {
                    warn!(command = %name, error = %e, "Undo command failed");
                }
            }
        }
    }
}
