//! Incremental Command Decoder
//!
//! Clients (and the append-only log) send commands either as a multi-bulk
//! frame of bulk strings or as a plain inline line:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
//! SET key value\r\n
//! ```
//!
//! The decoder works on whatever bytes are buffered so far and returns:
//! - `Ok(Some((line, consumed)))` when a whole command was decoded
//! - `Ok(None)` when the buffer holds only part of a command
//! - `Err(ProtocolError)` when the bytes can never form a valid command
//!
//! The caller advances its buffer by `consumed` and keeps going, which is what
//! makes pipelining and replaying a log file work with the same code.

use crate::protocol::reply::CmdLine;
use bytes::Bytes;
use thiserror::Error;

/// Largest bulk string accepted (512 MB, same as Redis).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Largest number of arguments in one multi-bulk command.
pub const MAX_ARGS: usize = 1024 * 1024;

/// Errors raised while decoding a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid multibulk length '{0}'")]
    InvalidMultiBulkLength(String),

    #[error("invalid bulk length '{0}'")]
    InvalidBulkLength(String),

    #[error("expected '$', got '{0}'")]
    ExpectedBulk(char),

    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("bulk string of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("empty inline command")]
    EmptyInline,

    #[error("invalid utf-8 in inline command")]
    InvalidInline,
}

pub type DecodeResult = Result<Option<(CmdLine, usize)>, ProtocolError>;

/// Stateless decoder for command lines.
///
/// ```
/// use tidekv::protocol::CommandParser;
///
/// let parser = CommandParser::new();
/// let (line, used) = parser.parse(b"PING\r\n").unwrap().unwrap();
/// assert_eq!(line[0], "PING");
/// assert_eq!(used, 6);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandParser;

impl CommandParser {
    pub fn new() -> Self {
        Self
    }

    /// Decodes the first complete command in `buf`. Blank lines before it
    /// are skipped and counted in `consumed`.
    pub fn parse(&self, buf: &[u8]) -> DecodeResult {
        let skipped = skip_blank_lines(buf);
        let rest = &buf[skipped..];
        let parsed = match rest.first() {
            None => return Ok(None),
            Some(b'*') => self.parse_multi_bulk(rest)?,
            Some(_) => self.parse_inline(rest)?,
        };
        Ok(parsed.map(|(line, used)| (line, skipped + used)))
    }

    fn parse_multi_bulk(&self, buf: &[u8]) -> DecodeResult {
        let Some(header_end) = find_crlf(&buf[1..]) else {
            return Ok(None);
        };
        let header = &buf[1..1 + header_end];
        let count = parse_len(header)
            .filter(|n| *n >= 0 && (*n as usize) <= MAX_ARGS)
            .ok_or_else(|| {
                ProtocolError::InvalidMultiBulkLength(String::from_utf8_lossy(header).into_owned())
            })? as usize;

        let mut pos = 1 + header_end + 2;
        let mut line = Vec::with_capacity(count);

        for _ in 0..count {
            match self.parse_bulk(&buf[pos..])? {
                Some((arg, used)) => {
                    line.push(arg);
                    pos += used;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((line, pos)))
    }

    fn parse_bulk(&self, buf: &[u8]) -> Result<Option<(Bytes, usize)>, ProtocolError> {
        match buf.first() {
            None => return Ok(None),
            Some(b'$') => {}
            Some(&other) => return Err(ProtocolError::ExpectedBulk(other as char)),
        }

        let Some(len_end) = find_crlf(&buf[1..]) else {
            return Ok(None);
        };
        let raw_len = &buf[1..1 + len_end];
        let len = parse_len(raw_len).filter(|n| *n >= 0).ok_or_else(|| {
            ProtocolError::InvalidBulkLength(String::from_utf8_lossy(raw_len).into_owned())
        })? as usize;

        if len > MAX_BULK_SIZE {
            return Err(ProtocolError::TooLarge {
                size: len,
                max: MAX_BULK_SIZE,
            });
        }

        let start = 1 + len_end + 2;
        let end = start + len;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::MissingCrlf);
        }

        Ok(Some((Bytes::copy_from_slice(&buf[start..end]), end + 2)))
    }

    fn parse_inline(&self, buf: &[u8]) -> DecodeResult {
        let Some(end) = find_crlf(buf) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| ProtocolError::InvalidInline)?;
        let line: CmdLine = text
            .split_whitespace()
            .map(|token| Bytes::copy_from_slice(token.as_bytes()))
            .collect();
        if line.is_empty() {
            return Err(ProtocolError::EmptyInline);
        }
        Ok(Some((line, end + 2)))
    }
}

fn parse_len(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Length of the run of complete blank lines (spaces and tabs only) at the
/// start of `buf`.
fn skip_blank_lines(buf: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        let mut end = pos;
        while matches!(buf.get(end), Some(b' ' | b'\t')) {
            end += 1;
        }
        if !buf[end..].starts_with(b"\r\n") {
            return pos;
        }
        pos = end + 2;
    }
}

/// Position of the first `\r\n` in `buf`, if any.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Convenience wrapper around [`CommandParser::parse`].
pub fn parse_command(buf: &[u8]) -> DecodeResult {
    CommandParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reply::{cmd_line, encode_cmd_line};

    #[test]
    fn test_parse_multi_bulk() {
        let input = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$4\r\nTide\r\n";
        let (line, used) = parse_command(input).unwrap().unwrap();
        assert_eq!(line, cmd_line(["SET", "user:101", "Tide"]));
        assert_eq!(used, input.len());
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(parse_command(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
        assert!(parse_command(b"*2\r\n$3\r\nGET\r\n$4\r\nna").unwrap().is_none());
        assert!(parse_command(b"*2").unwrap().is_none());
        assert!(parse_command(b"PING").unwrap().is_none());
    }

    #[test]
    fn test_parse_inline() {
        let (line, used) = parse_command(b"set  a   1\r\n").unwrap().unwrap();
        assert_eq!(line, cmd_line(["set", "a", "1"]));
        assert_eq!(used, 12);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert_eq!(parse_command(b"\r\n"), Ok(None));
        assert_eq!(parse_command(b"  \r\n\t\r\n"), Ok(None));

        let (line, used) = parse_command(b"\r\n   \r\nPING\r\n").unwrap().unwrap();
        assert_eq!(line, cmd_line(["PING"]));
        assert_eq!(used, 13);

        let input = b"\r\n*1\r\n$4\r\nPING\r\n";
        let (line, used) = parse_command(input).unwrap().unwrap();
        assert_eq!(line, cmd_line(["PING"]));
        assert_eq!(used, input.len());
    }

    #[test]
    fn test_parse_empty_inline() {
        assert_eq!(parse_command(b"\x0b\r\n"), Err(ProtocolError::EmptyInline));
    }

    #[test]
    fn test_parse_bad_lengths() {
        assert!(matches!(
            parse_command(b"*x\r\n"),
            Err(ProtocolError::InvalidMultiBulkLength(_))
        ));
        assert!(matches!(
            parse_command(b"*1\r\n$-1\r\n"),
            Err(ProtocolError::InvalidBulkLength(_))
        ));
        assert_eq!(
            parse_command(b"*1\r\n:1\r\n"),
            Err(ProtocolError::ExpectedBulk(':'))
        );
    }

    #[test]
    fn test_missing_trailing_crlf() {
        assert_eq!(
            parse_command(b"*1\r\n$3\r\nGETxx"),
            Err(ProtocolError::MissingCrlf)
        );
    }

    #[test]
    fn test_binary_safe_argument() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nhel\x00o\r\n";
        let (line, _) = parse_command(input).unwrap().unwrap();
        assert_eq!(line[1], Bytes::from(&b"hel\x00o"[..]));
    }

    #[test]
    fn test_pipelined_frames_decode_in_order() {
        let mut buf = Vec::new();
        encode_cmd_line(&cmd_line(["SET", "a", "1"]), &mut buf);
        encode_cmd_line(&cmd_line(["SET", "b", "2"]), &mut buf);

        let (first, used) = parse_command(&buf).unwrap().unwrap();
        let (second, rest) = parse_command(&buf[used..]).unwrap().unwrap();
        assert_eq!(first[1], "a");
        assert_eq!(second[1], "b");
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_empty_multi_bulk() {
        let (line, used) = parse_command(b"*0\r\n").unwrap().unwrap();
        assert!(line.is_empty());
        assert_eq!(used, 4);
    }
}
