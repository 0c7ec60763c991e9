//! Physical content units referenced by object versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A physical content record: where the bytes live and what they hash to.
///
/// Created empty (`readable = false`, `writable = true`, no URI) and becomes
/// `readable = true`, `writable = false` exactly once content is attached.
/// Many object versions, across buckets, may reference the same instance.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileInstance {
    pub id: Uuid,

    /// Storage URI; unique among non-null values.
    pub uri: Option<String>,

    pub storage_class: Option<String>,

    /// Size in bytes.
    pub size: i64,

    /// Algorithm-prefixed digest, e.g. `md5:5d41402abc4b2a76b9719d911017c592`.
    pub checksum: Option<String>,

    pub readable: bool,
    pub writable: bool,

    /// When the stored bytes were last verified against `checksum`.
    pub last_check_at: Option<DateTime<Utc>>,

    /// Outcome of the most recent verification.
    pub last_check: Option<bool>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl FileInstance {
    /// True once content has been associated with this instance.
    pub fn has_content(&self) -> bool {
        self.uri.is_some()
    }
}
