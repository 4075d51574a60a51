//! Wire Protocol
//!
//! TideKV speaks the Redis serialization protocol. The same encoding is used
//! on the socket and inside the append-only log, so this module is shared by
//! the connection layer and by log replay.
//!
//! ## Modules
//!
//! - `reply`: the `Reply` enum and its wire encoding
//! - `parser`: incremental decoder turning bytes into command lines
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{parse_command, Reply};
//! use bytes::Bytes;
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (line, consumed) = parse_command(data).unwrap().unwrap();
//! assert_eq!(line, vec![Bytes::from("GET"), Bytes::from("name")]);
//! assert_eq!(consumed, data.len());
//!
//! let reply = Reply::bulk(Bytes::from("tide"));
//! assert_eq!(reply.to_bytes(), b"$4\r\ntide\r\n");
//! ```

pub mod parser;
pub mod reply;

pub use parser::{parse_command, CommandParser, ProtocolError};
pub use reply::{cmd_line, CmdLine, Reply};
