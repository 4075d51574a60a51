//! Replies and Frames
//!
//! Every value TideKV sends to a client is a [`Reply`]. Each variant maps to
//! one message kind of the protocol:
//!
//! - `+` status: `+OK\r\n`
//! - `-` error: `-ERR unknown command 'foo'\r\n`
//! - `:` integer: `:42\r\n`
//! - `$` bulk string: `$5\r\nhello\r\n`, `$-1\r\n` for null
//! - `*` multi-bulk: `*2\r\n$3\r\nGET\r\n$1\r\na\r\n`, `*0\r\n` for empty
//!
//! This dialect never emits `*-1\r\n`; an absent array (for instance a
//! transaction aborted by WATCH) is the empty multi-bulk `*0\r\n`.
//!
//! A command line ([`CmdLine`]) is an ordered list of byte strings whose
//! first element is the command name. Frames in the append-only log are
//! command lines encoded as multi-bulk replies.

use bytes::Bytes;
use std::fmt;

const CRLF: &[u8] = b"\r\n";

/// One command: the name followed by its arguments.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from anything byte-like.
///
/// ```
/// use tidekv::protocol::cmd_line;
/// let line = cmd_line(["SET", "key", "value"]);
/// assert_eq!(line.len(), 3);
/// ```
pub fn cmd_line<I, T>(parts: I) -> CmdLine
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// A reply as it goes out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<text>\r\n`
    Status(String),
    /// `-<message>\r\n`
    Error(String),
    /// `:<n>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`
    Bulk(Bytes),
    /// `$-1\r\n`
    NullBulk,
    /// `*<count>\r\n` followed by the encoded elements
    MultiBulk(Vec<Reply>),
}

impl Reply {
    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn null_bulk() -> Self {
        Reply::NullBulk
    }

    pub fn multi_bulk(values: Vec<Reply>) -> Self {
        Reply::MultiBulk(values)
    }

    /// The `*0\r\n` marker used both for empty lists and for "no result".
    pub fn empty_multi_bulk() -> Self {
        Reply::MultiBulk(Vec::new())
    }

    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn pong() -> Self {
        Reply::Status("PONG".to_string())
    }

    pub fn queued() -> Self {
        Reply::Status("QUEUED".to_string())
    }

    /// Wraps a list of byte strings (for example `LRANGE` output or a
    /// log frame) into a multi-bulk reply of bulk strings.
    pub fn bulks<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        Reply::MultiBulk(items.into_iter().map(Reply::Bulk).collect())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Encodes this reply into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Encodes this reply at the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => write_line(buf, b'+', s.as_bytes()),
            Reply::Error(s) => write_line(buf, b'-', s.as_bytes()),
            Reply::Integer(n) => write_line(buf, b':', n.to_string().as_bytes()),
            Reply::Bulk(data) => write_bulk(buf, data),
            Reply::NullBulk => buf.extend_from_slice(b"$-1\r\n"),
            Reply::MultiBulk(values) => {
                write_line(buf, b'*', values.len().to_string().as_bytes());
                for value in values {
                    value.write_to(buf);
                }
            }
        }
    }
}

/// Encodes a command line as a multi-bulk frame without building a `Reply`.
///
/// This is the exact byte layout of one entry in the append-only log.
pub fn encode_cmd_line(line: &[Bytes], buf: &mut Vec<u8>) {
    write_line(buf, b'*', line.len().to_string().as_bytes());
    for arg in line {
        write_bulk(buf, arg);
    }
}

fn write_line(buf: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    buf.push(prefix);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    write_line(buf, b'$', data.len().to_string().as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::NullBulk => write!(f, "(nil)"),
            Reply::MultiBulk(values) if values.is_empty() => write!(f, "(empty array)"),
            Reply::MultiBulk(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_error() {
        assert_eq!(Reply::ok().to_bytes(), b"+OK\r\n");
        assert_eq!(Reply::queued().to_bytes(), b"+QUEUED\r\n");
        assert_eq!(
            Reply::error("ERR unknown command 'foo'").to_bytes(),
            b"-ERR unknown command 'foo'\r\n"
        );
    }

    #[test]
    fn test_integer() {
        assert_eq!(Reply::integer(1000).to_bytes(), b":1000\r\n");
        assert_eq!(Reply::integer(-2).to_bytes(), b":-2\r\n");
    }

    #[test]
    fn test_bulk_and_null() {
        assert_eq!(Reply::bulk(Bytes::from("hello")).to_bytes(), b"$5\r\nhello\r\n");
        assert_eq!(Reply::bulk(Bytes::new()).to_bytes(), b"$0\r\n\r\n");
        assert_eq!(Reply::null_bulk().to_bytes(), b"$-1\r\n");
    }

    #[test]
    fn test_empty_multi_bulk_is_not_null_array() {
        assert_eq!(Reply::empty_multi_bulk().to_bytes(), b"*0\r\n");
    }

    #[test]
    fn test_nested_multi_bulk() {
        let reply = Reply::multi_bulk(vec![
            Reply::ok(),
            Reply::integer(3),
            Reply::bulks(vec![Bytes::from("a"), Bytes::from("b")]),
        ]);
        assert_eq!(
            reply.to_bytes(),
            b"*3\r\n+OK\r\n:3\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n"
        );
    }

    #[test]
    fn test_encode_cmd_line() {
        let mut buf = Vec::new();
        encode_cmd_line(&cmd_line(["PEXPIREAT", "k", "1700000000000"]), &mut buf);
        assert_eq!(
            buf,
            b"*3\r\n$9\r\nPEXPIREAT\r\n$1\r\nk\r\n$13\r\n1700000000000\r\n"
        );
    }
}
