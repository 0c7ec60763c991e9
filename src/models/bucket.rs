//! Represents a logical bucket — a top-level container for versioned objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::storage::SizeLimit;

/// A logical container of object versions.
///
/// `size` is a running total adjusted in the same transaction as every
/// content attach or detach; it is never recomputed by aggregation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// Name of the [`Location`](super::location::Location) new content lands in.
    pub default_location: String,

    /// Storage class assigned to new content.
    pub default_storage_class: String,

    /// Sum of the sizes of all file instances attached through this bucket.
    pub size: i64,

    /// Optional cap on `size`.
    pub quota_size: Option<i64>,

    /// Optional cap on the size of a single attached file.
    pub max_file_size: Option<i64>,

    /// Locked buckets reject every mutating operation.
    pub locked: bool,

    /// Deleted buckets are hidden from listings and cannot be snapshotted.
    pub deleted: bool,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Bucket {
    /// Room left for one more file given the bucket's current size.
    pub fn size_limit(&self) -> SizeLimit {
        SizeLimit {
            max_file_size: self.max_file_size,
            quota: self.quota_size,
            used: self.size,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
