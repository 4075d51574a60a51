//! Rebuilding state as command lines.
//!
//! Used for whole-key undo and for the compacted log written by a rewrite.

use crate::protocol::CmdLine;
use crate::storage::DataValue;
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// One command that recreates `value` under `key` from nothing.
pub fn entity_to_cmd(key: &Bytes, value: &DataValue) -> CmdLine {
    match value {
        DataValue::String(data) => vec![Bytes::from_static(b"SET"), key.clone(), data.clone()],
        DataValue::List(items) => {
            let mut line = Vec::with_capacity(items.len() + 2);
            line.push(Bytes::from_static(b"RPUSH"));
            line.push(key.clone());
            line.extend(items.iter().cloned());
            line
        }
        DataValue::Hash(fields) => {
            let mut line = Vec::with_capacity(fields.len() * 2 + 2);
            line.push(Bytes::from_static(b"HSET"));
            line.push(key.clone());
            for (field, value) in fields {
                line.push(field.clone());
                line.push(value.clone());
            }
            line
        }
        DataValue::Set(members) => {
            let mut line = Vec::with_capacity(members.len() + 2);
            line.push(Bytes::from_static(b"SADD"));
            line.push(key.clone());
            line.extend(members.iter().cloned());
            line
        }
    }
}

/// `PEXPIREAT key <unix millis>`
pub fn expire_at_cmd(key: &Bytes, at: SystemTime) -> CmdLine {
    vec![
        Bytes::from_static(b"PEXPIREAT"),
        key.clone(),
        Bytes::from(unix_millis(at).to_string()),
    ]
}

/// `PEXPIREAT` for a volatile key, `PERSIST` otherwise.
pub fn ttl_cmd(key: &Bytes, at: Option<SystemTime>) -> CmdLine {
    match at {
        Some(at) => expire_at_cmd(key, at),
        None => vec![Bytes::from_static(b"PERSIST"), key.clone()],
    }
}

pub fn unix_millis(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmd_line;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::time::Duration;

    #[test]
    fn test_string_to_set() {
        let key = Bytes::from("greeting");
        let line = entity_to_cmd(&key, &DataValue::String(Bytes::from("hi")));
        assert_eq!(line, cmd_line(["SET", "greeting", "hi"]));
    }

    #[test]
    fn test_list_keeps_order() {
        let key = Bytes::from("l");
        let items: VecDeque<Bytes> = ["a", "b", "c"].into_iter().map(Bytes::from).collect();
        let line = entity_to_cmd(&key, &DataValue::List(items));
        assert_eq!(line, cmd_line(["RPUSH", "l", "a", "b", "c"]));
    }

    #[test]
    fn test_hash_and_set_shapes() {
        let key = Bytes::from("h");
        let mut fields = HashMap::new();
        fields.insert(Bytes::from("f"), Bytes::from("v"));
        assert_eq!(
            entity_to_cmd(&key, &DataValue::Hash(fields)),
            cmd_line(["HSET", "h", "f", "v"])
        );

        let mut members = HashSet::new();
        members.insert(Bytes::from("m"));
        assert_eq!(
            entity_to_cmd(&key, &DataValue::Set(members)),
            cmd_line(["SADD", "h", "m"])
        );
    }

    #[test]
    fn test_ttl_cmd() {
        let key = Bytes::from("k");
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(
            ttl_cmd(&key, Some(at)),
            cmd_line(["PEXPIREAT", "k", "1700000000123"])
        );
        assert_eq!(ttl_cmd(&key, None), cmd_line(["PERSIST", "k"]));
    }
}
