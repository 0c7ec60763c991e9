//! One version of a keyed object inside a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::mimetype;

/// A version of `key` in a bucket, addressed by `(bucket_id, key, version_id)`.
///
/// A version without a `file_id` is a delete marker. At most one version per
/// `(bucket_id, key)` has `is_head` set.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ObjectVersion {
    pub bucket_id: Uuid,
    pub key: String,
    pub version_id: Uuid,

    /// Referenced content; `None` marks a deletion.
    pub file_id: Option<Uuid>,

    /// Explicit MIME type override; see [`ObjectVersion::mimetype`].
    #[serde(rename = "mimetype_override")]
    #[sqlx(rename = "mimetype")]
    pub mimetype_override: Option<String>,

    pub is_head: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ObjectVersion {
    pub fn is_delete_marker(&self) -> bool {
        self.file_id.is_none()
    }

    /// Effective MIME type: the override if one was set, otherwise a guess
    /// based on the key's extension.
    pub fn mimetype(&self) -> String {
        match &self.mimetype_override {
            Some(mimetype) => mimetype.clone(),
            None => mimetype::guess(&self.key),
        }
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bucket_id, self.version_id, self.key)
    }
}
