//! BucketManager — logical containers, their size/quota bookkeeping, lock and
//! deletion flags, and snapshots.

use chrono::Utc;
use serde::Deserialize;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::StorageClassConfig,
    db::begin_write,
    errors::{StorageError, StorageResult},
    models::{bucket::Bucket, location::Location},
    services::{
        bucket_tag_store::BucketTagStore, location_registry::LocationRegistry,
        object_version_index::insert_version,
    },
};

const BUCKET_COLUMNS: &str = "id, default_location, default_storage_class, size, quota_size, \
                              max_file_size, locked, deleted, created, updated";

/// Parameters for [`BucketManager::create`]. Everything is optional.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewBucket {
    /// Location name; the default location when absent.
    pub location: Option<String>,
    pub storage_class: Option<String>,
    pub quota_size: Option<i64>,
    pub max_file_size: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct BucketManager {
    config: StorageClassConfig,
    locations: LocationRegistry,
    tags: BucketTagStore,
}

impl BucketManager {
    pub fn new(config: StorageClassConfig) -> Self {
        Self {
            config,
            locations: LocationRegistry::new(),
            tags: BucketTagStore::new(),
        }
    }

    /// Create an empty, unlocked bucket.
    ///
    /// Fails with [`StorageError::Validation`] for a storage class outside
    /// the configured set and [`StorageError::LocationNotFound`] when the
    /// location cannot be resolved.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        params: NewBucket,
    ) -> StorageResult<Bucket> {
        let storage_class = params
            .storage_class
            .unwrap_or_else(|| self.config.default.clone());
        if !self.config.is_allowed(&storage_class) {
            return Err(StorageError::Validation(format!(
                "storage class `{}` is not one of {:?}",
                storage_class, self.config.allowed
            )));
        }
        let location = self
            .locations
            .resolve(conn, params.location.as_deref())
            .await?;

        let now = Utc::now();
        let bucket = Bucket {
            id: Uuid::new_v4(),
            default_location: location.name,
            default_storage_class: storage_class,
            size: 0,
            quota_size: params.quota_size,
            max_file_size: params.max_file_size,
            locked: false,
            deleted: false,
            created: now,
            updated: now,
        };

        sqlx::query(
            "INSERT INTO buckets (id, default_location, default_storage_class, size, quota_size,
                                  max_file_size, locked, deleted, created, updated)
             VALUES (?, ?, ?, 0, ?, ?, 0, 0, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.default_location)
        .bind(&bucket.default_storage_class)
        .bind(bucket.quota_size)
        .bind(bucket.max_file_size)
        .bind(bucket.created)
        .bind(bucket.updated)
        .execute(&mut *conn)
        .await?;

        info!("created bucket {} in location {}", bucket.id, bucket.default_location);
        Ok(bucket)
    }

    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> StorageResult<Option<Bucket>> {
        let bucket = sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(bucket)
    }

    /// Like [`get`](Self::get) but a missing bucket is an error.
    pub async fn fetch(&self, conn: &mut SqliteConnection, id: Uuid) -> StorageResult<Bucket> {
        self.get(conn, id).await?.ok_or(StorageError::BucketNotFound(id))
    }

    /// Buckets not flagged as deleted, in creation order.
    pub async fn all(&self, conn: &mut SqliteConnection) -> StorageResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM buckets WHERE deleted = 0 ORDER BY rowid ASC"
        ))
        .fetch_all(&mut *conn)
        .await?;
        Ok(buckets)
    }

    /// The location new content of `bucket` is written to.
    pub async fn location(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
    ) -> StorageResult<Location> {
        self.locations
            .resolve(conn, Some(&bucket.default_location))
            .await
    }

    pub async fn set_locked(
        &self,
        conn: &mut SqliteConnection,
        bucket: &mut Bucket,
        locked: bool,
    ) -> StorageResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE buckets SET locked = ?, updated = ? WHERE id = ?")
            .bind(locked)
            .bind(now)
            .bind(bucket.id)
            .execute(&mut *conn)
            .await?;
        bucket.locked = locked;
        bucket.updated = now;
        Ok(())
    }

    pub async fn set_deleted(
        &self,
        conn: &mut SqliteConnection,
        bucket: &mut Bucket,
        deleted: bool,
    ) -> StorageResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE buckets SET deleted = ?, updated = ? WHERE id = ?")
            .bind(deleted)
            .bind(now)
            .bind(bucket.id)
            .execute(&mut *conn)
            .await?;
        bucket.deleted = deleted;
        bucket.updated = now;
        Ok(())
    }

    /// Delete a bucket together with its tags and object versions.
    ///
    /// Referenced file instances are left untouched; they may be shared with
    /// other buckets.
    pub async fn remove(&self, conn: &mut SqliteConnection, id: Uuid) -> StorageResult<()> {
        let mut tx = begin_write(conn).await?;
        let bucket = self.fetch(&mut tx, id).await?;
        if bucket.locked {
            return Err(StorageError::BucketLocked(id));
        }

        let tags = self.tags.delete_all(&mut tx, id).await?;
        let versions = sqlx::query("DELETE FROM object_versions WHERE bucket_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("removed bucket {} ({} versions, {} tags)", id, versions, tags);
        Ok(())
    }

    /// Fork the current head versions of a bucket into a new bucket.
    ///
    /// Every key whose head carries content gets one head version in the new
    /// bucket referencing the same file instance; history and delete markers
    /// are not carried over. No bytes are copied.
    pub async fn snapshot(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        lock: bool,
    ) -> StorageResult<Bucket> {
        let mut tx = begin_write(conn).await?;
        let source = self.fetch(&mut tx, id).await?;
        if source.deleted {
            return Err(StorageError::InvalidOperation(format!(
                "bucket `{}` is deleted and cannot be snapshotted",
                id
            )));
        }

        let mut snapshot = self
            .create(
                &mut tx,
                NewBucket {
                    location: Some(source.default_location.clone()),
                    storage_class: Some(source.default_storage_class.clone()),
                    quota_size: source.quota_size,
                    max_file_size: source.max_file_size,
                },
            )
            .await?;

        let heads = sqlx::query_as::<_, (String, Uuid, Option<String>, i64)>(
            "SELECT ov.key, ov.file_id, ov.mimetype, f.size
             FROM object_versions ov JOIN files f ON f.id = ov.file_id
             WHERE ov.bucket_id = ? AND ov.is_head = 1
             ORDER BY ov.key ASC",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let mut total: i64 = 0;
        for (key, file_id, mimetype, size) in &heads {
            insert_version(&mut tx, snapshot.id, key, Some(*file_id), mimetype.as_deref()).await?;
            total += size;
        }
        self.adjust_size(&mut tx, snapshot.id, total).await?;
        snapshot.size = total;

        if lock {
            self.set_locked(&mut tx, &mut snapshot, true).await?;
        }
        tx.commit().await?;

        info!(
            "snapshotted bucket {} into {} ({} objects, locked: {})",
            id,
            snapshot.id,
            heads.len(),
            lock
        );
        Ok(snapshot)
    }

    /// All tags of the bucket as a key → value map.
    pub async fn get_tags(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> StorageResult<BTreeMap<String, String>> {
        self.tags.get_all(conn, id).await
    }

    /// Atomically add `delta` bytes to the bucket's running size.
    pub(crate) async fn adjust_size(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        delta: i64,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE buckets SET size = size + ?, updated = ? WHERE id = ?")
            .bind(delta)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Reject attaching `size` more bytes to `bucket` when that would break
    /// its per-file or total limits.
    pub(crate) fn ensure_within_limits(bucket: &Bucket, size: i64) -> StorageResult<()> {
        bucket.size_limit().check(size)
    }
}
