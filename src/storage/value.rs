//! Stored values.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};

/// Every key holds exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    String(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    Set(HashSet<Bytes>),
}

impl DataValue {
    /// The name `TYPE` reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::List(_) => "list",
            DataValue::Hash(_) => "hash",
            DataValue::Set(_) => "set",
        }
    }

    /// True for a collection with no elements left. Such keys are removed.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            DataValue::String(_) => false,
            DataValue::List(l) => l.is_empty(),
            DataValue::Hash(h) => h.is_empty(),
            DataValue::Set(s) => s.is_empty(),
        }
    }
}

impl From<Bytes> for DataValue {
    fn from(value: Bytes) -> Self {
        DataValue::String(value)
    }
}
