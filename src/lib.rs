//! # TideKV - An In-Memory Key-Value Store
//!
//! TideKV speaks the Redis protocol and keeps strings, lists, hashes and
//! sets in a sharded in-memory keyspace. Commands that touch several keys
//! lock them together through a striped lock table, `MULTI`/`EXEC`
//! transactions are optimistic with undo-based rollback, keys expire
//! through a hashed time wheel, and writes can be made durable with an
//! append-only file that is compacted online.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TideKV                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────┐     │
//! │  │ TCP Server  │───>│ Connection  │───>│ Db::exec                 │     │
//! │  │ (Listener)  │    │  Handler    │    │ auth · MULTI · dispatch  │     │
//! │  └─────────────┘    └─────────────┘    └────────────┬─────────────┘     │
//! │                                                     │                   │
//! │          ┌───────────────┬──────────────────────────┼──────────┐        │
//! │          ▼               ▼                          ▼          ▼        │
//! │  ┌──────────────┐ ┌─────────────┐ ┌───────────────────┐ ┌───────────┐  │
//! │  │ CommandTable │ │  LockTable  │ │ Dict<DataValue>   │ │    Aof    │  │
//! │  │ exec/keys/   │ │ ordered     │ │ Dict<SystemTime>  │ │ writer    │  │
//! │  │ undo/arity   │ │ batch locks │ │ Dict<u64> version │ │ thread    │  │
//! │  └──────────────┘ └─────────────┘ └─────────┬─────────┘ └───────────┘  │
//! │                                             │                          │
//! │                                    ┌────────┴────────┐                 │
//! │                                    │    TimeWheel    │                 │
//! │                                    │ (Tokio task)    │                 │
//! │                                    └─────────────────┘                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidekv::db::{Db, DbOptions};
//! use tidekv::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = Db::open(DbOptions::default())?;
//!     let server = Server::bind("127.0.0.1:6379", db.clone(), Some(10_000)).await?;
//!     server.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//!     db.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: command decoder and reply encoding
//! - [`storage`]: sharded dictionary, lock table, time wheel, value types
//! - [`db`]: the engine: dispatch, transactions, expiry, append-only log
//! - [`commands`]: every registered command
//! - [`connection`]: per-client read/execute/reply loop
//! - [`server`]: accept loop and client limit
//! - [`config`]: config file and command-line layering

pub mod commands;
pub mod config;
pub mod connection;
pub mod db;
pub mod protocol;
pub mod server;
pub mod storage;

pub use commands::CommandError;
pub use config::{Config, ConfigError};
pub use connection::{handle_connection, ConnectionStats};
pub use db::{Db, DbOptions, Session};
pub use protocol::{CommandParser, ProtocolError, Reply};

/// The default port TideKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
