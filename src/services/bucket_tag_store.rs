//! Key/value tags on buckets, independent of object versioning.

use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{
    errors::{StorageResult, map_unique},
    models::bucket_tag::BucketTag,
};

#[derive(Clone, Debug, Default)]
pub struct BucketTagStore;

impl BucketTagStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new tag; an existing `(bucket, key)` is a uniqueness violation.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        value: &str,
    ) -> StorageResult<BucketTag> {
        sqlx::query("INSERT INTO bucket_tags (bucket_id, key, value) VALUES (?, ?, ?)")
            .bind(bucket_id)
            .bind(key)
            .bind(value)
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                map_unique(err, format!("tag `{}` already set on bucket `{}`", key, bucket_id))
            })?;

        Ok(BucketTag {
            bucket_id,
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Insert or overwrite a tag.
    pub async fn create_or_update(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        value: &str,
    ) -> StorageResult<BucketTag> {
        let tag = sqlx::query_as::<_, BucketTag>(
            "INSERT INTO bucket_tags (bucket_id, key, value) VALUES (?, ?, ?)
             ON CONFLICT(bucket_id, key) DO UPDATE SET value = excluded.value
             RETURNING bucket_id, key, value",
        )
        .bind(bucket_id)
        .bind(key)
        .bind(value)
        .fetch_one(&mut *conn)
        .await?;
        Ok(tag)
    }

    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<Option<BucketTag>> {
        let tag = sqlx::query_as::<_, BucketTag>(
            "SELECT bucket_id, key, value FROM bucket_tags WHERE bucket_id = ? AND key = ?",
        )
        .bind(bucket_id)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(tag)
    }

    pub async fn get_value(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<Option<String>> {
        Ok(self.get(conn, bucket_id, key).await?.map(|tag| tag.value))
    }

    /// Delete a tag. Deleting a missing tag is not an error.
    pub async fn delete(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<()> {
        sqlx::query("DELETE FROM bucket_tags WHERE bucket_id = ? AND key = ?")
            .bind(bucket_id)
            .bind(key)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_all(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
    ) -> StorageResult<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM bucket_tags WHERE bucket_id = ?",
        )
        .bind(bucket_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Drop every tag of a bucket, returning how many were removed.
    pub(crate) async fn delete_all(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
    ) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM bucket_tags WHERE bucket_id = ?")
            .bind(bucket_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}
