//! Record trait and index values

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A value stored in the index table for filtered lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// Column in `record_indexes` that holds this kind of value
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::String(_) => "value_str",
            Self::Int(_) | Self::Bool(_) => "value_int",
        }
    }

    pub(crate) fn to_sql(&self) -> rusqlite::types::Value {
        match self {
            Self::String(s) => rusqlite::types::Value::Text(s.clone()),
            Self::Int(i) => rusqlite::types::Value::Integer(*i),
            Self::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A persistable record
///
/// Implementors choose their collection name and which fields are indexed.
/// Indexes are rewritten on every create/update.
pub trait Record: Serialize + DeserializeOwned {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last modification time (unix ms)
    fn updated_at(&self) -> i64;

    /// Name of the collection this record type lives in
    fn collection_name() -> &'static str;

    /// Fields to index for filtered queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;

    /// Receive the store-assigned insertion sequence number
    ///
    /// Called once, inside the inserting transaction, before the record is
    /// serialized. Sequence numbers are strictly increasing across the store.
    fn set_seq(&mut self, _seq: i64) {}
}
