//! Key/value metadata attached to a bucket.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single tag; `key` is unique per bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct BucketTag {
    pub bucket_id: Uuid,
    pub key: String,
    pub value: String,
}
