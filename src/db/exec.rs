//! Command dispatch.
//!
//! [`Db::exec`] is the only entry point connections use. It is also the
//! single place a panic inside a command is caught and turned into an
//! error reply.

use crate::commands::CommandError;
use crate::db::multi::Session;
use crate::db::registry::{command_name, validate_arity};
use crate::db::Db;
use crate::protocol::Reply;
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{info, warn};

impl Db {
    /// Runs one command line for a connection.
    pub fn exec(&self, session: &mut Session, line: &[Bytes]) -> Reply {
        match catch_unwind(AssertUnwindSafe(|| self.dispatch(session, line))) {
            Ok(reply) => reply,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                warn!(
                    command = %command_name(line),
                    panic = %detail,
                    "Command panicked"
                );
                Reply::error("ERR unknown")
            }
        }
    }

    fn dispatch(&self, session: &mut Session, line: &[Bytes]) -> Reply {
        if line.is_empty() {
            return Reply::error("ERR empty command");
        }
        let name = command_name(line);

        if name == "auth" {
            return self.auth(session, line);
        }
        if self.password().is_some() && !session.is_authenticated() {
            return Reply::error("NOAUTH Authentication required.");
        }

        if let Some(reply) = self.exec_special(session, &name, line) {
            return reply;
        }

        if session.in_multi() {
            return self.enqueue(session, line);
        }

        self.exec_normal(&name, line)
    }

    fn auth(&self, session: &mut Session, line: &[Bytes]) -> Reply {
        if line.len() != 2 {
            return CommandError::WrongArity("auth".to_string()).into();
        }
        let Some(password) = self.password() else {
            return Reply::error("ERR Client sent AUTH, but no password is set");
        };
        if line[1] == password.as_bytes() {
            session.set_authenticated(true);
            Reply::ok()
        } else {
            session.set_authenticated(false);
            Reply::error("ERR invalid password")
        }
    }

    fn exec_special(&self, session: &mut Session, name: &str, line: &[Bytes]) -> Option<Reply> {
        let arity = |n: i32| -> Option<Reply> {
            if validate_arity(n, line) {
                None
            } else {
                Some(CommandError::WrongArity(name.to_string()).into())
            }
        };

        let reply = match name {
            "multi" => arity(1).unwrap_or_else(|| self.start_multi(session)),
            "exec" => arity(1).unwrap_or_else(|| self.exec_queued(session)),
            "discard" => arity(1).unwrap_or_else(|| self.discard_multi(session)),
            "watch" => arity(-2).unwrap_or_else(|| self.watch(session, &line[1..])),
            "unwatch" => arity(1).unwrap_or_else(|| self.unwatch(session)),
            "bgrewriteaof" => arity(1).unwrap_or_else(|| self.bg_rewrite_aof()),
            "getver" => arity(2)
                .unwrap_or_else(|| Reply::integer(self.get_version(&line[1]) as i64)),
            _ => return None,
        };
        Some(reply)
    }

    fn exec_normal(&self, name: &str, line: &[Bytes]) -> Reply {
        let Some(cmd) = self.commands().get(name) else {
            return CommandError::UnknownCommand(name.to_string()).into();
        };
        if !validate_arity(cmd.arity, line) {
            return CommandError::WrongArity(name.to_string()).into();
        }

        let args = &line[1..];
        let (write_keys, read_keys) = cmd.keys(args);
        self.add_version(&write_keys);
        let _guard = self.locks().lock_read_write(&write_keys, &read_keys);

        match (cmd.executor)(self, args) {
            Ok(reply) => reply,
            Err(e) => e.into(),
        }
    }

    fn bg_rewrite_aof(&self) -> Reply {
        let Some(aof) = self.aof() else {
            return Reply::error("ERR append only file is disabled");
        };
        if aof.is_rewriting() {
            return Reply::error("ERR Background append only file rewriting already in progress");
        }
        let Some(db) = self.handle() else {
            return Reply::error("ERR unknown");
        };

        let spawned = std::thread::Builder::new()
            .name("aof-rewrite".to_string())
            .spawn(move || {
                if db.rewrite_aof().is_ok() {
                    info!("Background AOF rewrite completed");
                }
            });

        match spawned {
            Ok(_) => Reply::status("Background append only file rewriting started"),
            Err(e) => Reply::error(format!("ERR {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AofConfig, CommandTable, DbOptions};
    use crate::protocol::cmd_line;
    use std::sync::Arc;
    use std::time::Duration;

    fn db() -> Arc<Db> {
        Db::replica(Arc::new(CommandTable::builtin()))
    }

    fn run(db: &Db, session: &mut Session, parts: &[&str]) -> Reply {
        db.exec(session, &cmd_line(parts.iter().copied()))
    }

    #[test]
    fn test_unknown_and_arity() {
        let db = db();
        let mut s = Session::new();
        assert_eq!(
            run(&db, &mut s, &["FOO"]),
            Reply::error("ERR unknown command 'foo'")
        );
        assert_eq!(
            run(&db, &mut s, &["GET"]),
            Reply::error("ERR wrong number of arguments for 'get' command")
        );
        assert_eq!(
            run(&db, &mut s, &["MULTI", "x"]),
            Reply::error("ERR wrong number of arguments for 'multi' command")
        );
        assert!(db.exec(&mut s, &[]).is_error());
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let db = db();
        let mut s = Session::new();
        assert_eq!(run(&db, &mut s, &["sEt", "k", "v"]), Reply::ok());
        assert_eq!(run(&db, &mut s, &["get", "k"]), Reply::bulk(Bytes::from("v")));
    }

    #[test]
    fn test_getver() {
        let db = db();
        let mut s = Session::new();
        assert_eq!(run(&db, &mut s, &["GETVER", "k"]), Reply::integer(0));
        run(&db, &mut s, &["SET", "k", "1"]);
        run(&db, &mut s, &["GET", "k"]);
        assert_eq!(run(&db, &mut s, &["GETVER", "k"]), Reply::integer(1));
    }

    #[tokio::test]
    async fn test_auth_gate() {
        let db = Db::open(DbOptions {
            requirepass: Some("secret".to_string()),
            ..DbOptions::for_tests()
        })
        .unwrap();
        let mut s = Session::new();

        assert_eq!(
            run(&db, &mut s, &["GET", "k"]),
            Reply::error("NOAUTH Authentication required.")
        );
        assert_eq!(
            run(&db, &mut s, &["MULTI"]),
            Reply::error("NOAUTH Authentication required.")
        );
        assert_eq!(
            run(&db, &mut s, &["AUTH", "wrong"]),
            Reply::error("ERR invalid password")
        );
        assert_eq!(run(&db, &mut s, &["AUTH", "secret"]), Reply::ok());
        assert_eq!(run(&db, &mut s, &["GET", "k"]), Reply::null_bulk());
    }

    #[test]
    fn test_auth_without_password() {
        let db = db();
        let mut s = Session::new();
        assert_eq!(
            run(&db, &mut s, &["AUTH", "x"]),
            Reply::error("ERR Client sent AUTH, but no password is set")
        );
    }

    #[test]
    fn test_bgrewriteaof_without_aof() {
        let db = db();
        let mut s = Session::new();
        assert!(run(&db, &mut s, &["BGREWRITEAOF"]).is_error());
    }

    #[tokio::test]
    async fn test_bgrewriteaof_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let db = Db::open(DbOptions {
            aof: Some(AofConfig::new(&path)),
            ..DbOptions::for_tests()
        })
        .unwrap();
        let mut s = Session::new();
        for i in 0..50 {
            run(&db, &mut s, &["SET", "counter", &i.to_string()]);
        }

        assert_eq!(
            run(&db, &mut s, &["BGREWRITEAOF"]),
            Reply::status("Background append only file rewriting started")
        );
        let mut size = u64::MAX;
        for _ in 0..200 {
            db.aof().unwrap().flush().unwrap();
            size = std::fs::metadata(&path).unwrap().len();
            if size < 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        db.close();
        assert!(size < 100, "log was not compacted: {} bytes", size);
    }

    #[test]
    fn test_panicking_command_is_contained() {
        fn boom(_: &Db, _: &[Bytes]) -> Result<Reply, CommandError> {
            panic!("executor bug");
        }
        let mut table = CommandTable::builtin();
        table.register("boom", boom, None, None, 1);
        let db = Db::replica(Arc::new(table));
        let mut s = Session::new();

        assert_eq!(run(&db, &mut s, &["BOOM"]), Reply::error("ERR unknown"));
        assert_eq!(run(&db, &mut s, &["SET", "k", "v"]), Reply::ok());
    }
}
