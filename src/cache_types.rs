//! Cache Types Module
//!
//! Basic data structures shared by the consistency cache, the orchestrator and the
//! collaborator connectors.

use serde::{Deserialize, Serialize};

/// Database version of a value, on the nanosecond epoch shared with invalidation timestamps.
pub type Version = u64;

/// `valid_until` of an item no invalidation has narrowed yet.
pub const VALID_FOREVER: Version = Version::MAX;

/// A value read from the database or cache store together with its version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub key: String,
    pub value: String,
    pub version: Version,
}

impl ItemRecord {
    pub fn new(key: impl Into<String>, value: impl Into<String>, version: Version) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
        }
    }

    /// Bytes charged against the cache budget.
    pub fn size(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// Per-key triage of a read batch that is not a full MCC hit.
///
/// Each partition preserves the relative order of the input keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MccHitResult {
    /// Keys not present in the cache
    pub missing_items: Vec<String>,
    /// Keys cached at a version that cannot currently be trusted
    pub outdated_items: Vec<String>,
    /// Keys cached, unbounded and covered by the invalidation watermark
    pub hit_items: Vec<String>,
}

/// Outcome of one operation inside a cache store batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOpResult {
    /// Result of a select; `None` when the store does not hold the key
    Value(Option<String>),
    /// Result of a delete; `true` when the key existed
    Deleted(bool),
    /// Result of a put
    Stored,
}
