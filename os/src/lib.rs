//! OutcomeStore - generic persistent record storage
//!
//! Stores serde-serializable records as JSON documents in SQLite, with a
//! secondary index table for the fields each record type chooses to expose.
//! Records are grouped into collections; every record carries a stable id
//! and an `updated_at` timestamp.
//!
//! # Core Concepts
//!
//! - **Documents**: records persist as JSON blobs, one row per record
//! - **Indexes**: `indexed_fields()` values are mirrored into a side table
//!   so equality filters run in SQL instead of full scans
//! - **Transactions**: every write is atomic; multi-record mutations go
//!   through [`Store::transaction`]

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

mod store;

pub use store::{Store, StoreTxn};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value that can appear in a record's secondary index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// Canonical text form used for SQL comparison
    pub fn as_sql_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => format!("{:020}", i),
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        }
    }
}

impl std::fmt::Display for IndexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Comparison operator for filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

/// A filter over a record's indexed fields
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality filter, the common case
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Check a set of indexed fields against this filter
    pub fn matches(&self, fields: &HashMap<String, IndexValue>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };
        let (a, b) = (actual.as_sql_text(), self.value.as_sql_text());
        match self.op {
            FilterOp::Eq => a == b,
            FilterOp::Ne => a != b,
            FilterOp::Lt => a < b,
            FilterOp::Gt => a > b,
        }
    }
}

/// A persistable record
///
/// Implementors choose a collection name and which fields to mirror into
/// the secondary index. The store never inspects the JSON payload itself.
pub trait Record: Serialize + DeserializeOwned {
    /// Stable unique identifier
    fn id(&self) -> &str;

    /// Last modification time (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection this record type lives in
    fn collection_name() -> &'static str;

    /// Fields exposed to the secondary index
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_value_sql_text() {
        assert_eq!(IndexValue::from("pending").as_sql_text(), "pending");
        assert_eq!(IndexValue::from(true).as_sql_text(), "1");
        // Zero-padded so lexicographic order matches numeric order
        assert!(IndexValue::from(9i64).as_sql_text() < IndexValue::from(10i64).as_sql_text());
    }

    #[test]
    fn test_filter_matches() {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::from("pending"));
        fields.insert("priority".to_string(), IndexValue::from(10i64));

        assert!(Filter::eq("status", "pending").matches(&fields));
        assert!(!Filter::eq("status", "running").matches(&fields));
        assert!(Filter::new("priority", FilterOp::Lt, 20i64).matches(&fields));
        assert!(Filter::new("priority", FilterOp::Gt, 5i64).matches(&fields));
        assert!(!Filter::eq("missing", "x").matches(&fields));
    }
}
