//! Versioned session state store.
//!
//! The store is the only coordination point between workers. Every record
//! carries a version and every write is conditional on it:
//!
//! | Stored       | Written version | Outcome  |
//! |--------------|-----------------|----------|
//! | absent       | 0               | accepted |
//! | version `v`  | `v + 1`         | accepted |
//! | anything else|                 | conflict |
//!
//! `put` and `delete` return only the conflicted subset, keyed by record key.
//! An empty map means every record was applied.
//!
//! [`StateStore`] is the backing-store seam; [`InMemoryStateStore`] implements
//! it in process. [`SessionStateStore`] layers bounded read-modify-write loops
//! on top.

mod memory;
mod metadata;
mod session_store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryStateStore;
pub use metadata::{Counterparties, SessionMetadata};
pub use session_store::{CreateOutcome, Mutation, SessionStateStore, Updated};

/// Errors reported by a backing store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store could not be reached or refused the request
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Record metadata could not be (de)serialized for filtering
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Comparison operator for filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
}

impl Comparison {
    /// Apply to an already computed ordering
    pub fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};

        match self {
            Self::Equal => ordering == Equal,
            Self::NotEqual => ordering != Equal,
            Self::LessThan => ordering == Less,
            Self::LessThanOrEqual => ordering != Greater,
            Self::GreaterThan => ordering == Greater,
            Self::GreaterThanOrEqual => ordering != Less,
        }
    }

    /// Compare two JSON values.
    ///
    /// Numbers compare numerically and strings lexicographically. Values of
    /// different kinds only satisfy `NotEqual`.
    pub fn matches_json(&self, left: &serde_json::Value, right: &serde_json::Value) -> bool {
        use serde_json::Value;

        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (a, b) if a == b => Some(std::cmp::Ordering::Equal),
            _ => None,
        };

        match ordering {
            Some(ordering) => self.matches(ordering),
            None => *self == Self::NotEqual,
        }
    }
}

/// One persisted session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record key
    pub key: String,
    /// Version this record has once written
    pub version: u64,
    /// Opaque serialized negotiation material
    pub value: Vec<u8>,
    /// Queryable metadata
    pub metadata: SessionMetadata,
    /// Last write time
    pub modified_time: DateTime<Utc>,
}

impl StateRecord {
    /// Record for a first write (version 0)
    pub fn initial(key: impl Into<String>, value: Vec<u8>, metadata: SessionMetadata) -> Self {
        Self {
            key: key.into(),
            version: 0,
            value,
            metadata,
            modified_time: Utc::now(),
        }
    }

    /// Successor of this record carrying new contents
    pub fn successor(&self, value: Vec<u8>, metadata: SessionMetadata) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version + 1,
            value,
            metadata,
            modified_time: Utc::now(),
        }
    }
}

/// Optimistically versioned key-value store
pub trait StateStore: Send + Sync {
    /// Fetch the records that exist among `keys`
    fn get(&self, keys: &[String]) -> Result<HashMap<String, StateRecord>, StoreError>;

    /// Conditionally write records; returns the rejected ones
    fn put(&self, records: Vec<StateRecord>) -> Result<HashMap<String, StateRecord>, StoreError>;

    /// Delete records whose stored version equals the given one; returns the
    /// rejected ones. Absent keys are treated as already deleted.
    fn delete(&self, records: Vec<StateRecord>)
        -> Result<HashMap<String, StateRecord>, StoreError>;

    /// Records whose `modified_time` compares to `time` as requested
    fn filter_by_modified_time(
        &self,
        time: DateTime<Utc>,
        comparison: Comparison,
    ) -> Result<Vec<StateRecord>, StoreError>;

    /// Records whose metadata field `field` compares to `value` as requested
    fn filter_by_metadata(
        &self,
        field: &str,
        value: &serde_json::Value,
        comparison: Comparison,
    ) -> Result<Vec<StateRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comparison_orderings() {
        use std::cmp::Ordering;

        assert!(Comparison::LessThanOrEqual.matches(Ordering::Equal));
        assert!(Comparison::LessThanOrEqual.matches(Ordering::Less));
        assert!(!Comparison::LessThan.matches(Ordering::Equal));
        assert!(Comparison::NotEqual.matches(Ordering::Greater));
        assert!(Comparison::GreaterThanOrEqual.matches(Ordering::Greater));
    }

    #[test]
    fn test_comparison_json() {
        assert!(Comparison::Equal.matches_json(&json!("ESTABLISHED"), &json!("ESTABLISHED")));
        assert!(Comparison::GreaterThan.matches_json(&json!(3), &json!(2)));
        assert!(Comparison::LessThan.matches_json(&json!(1.5), &json!(2)));
        assert!(Comparison::Equal.matches_json(&json!(false), &json!(false)));

        // Mixed kinds only satisfy NotEqual
        assert!(!Comparison::Equal.matches_json(&json!("1"), &json!(1)));
        assert!(Comparison::NotEqual.matches_json(&json!("1"), &json!(1)));
        assert!(Comparison::Equal.matches_json(&json!(null), &json!(null)));
    }
}
