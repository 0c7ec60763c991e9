//! ObjectVersionIndex — per-bucket, per-key version chains.
//!
//! Every write to a key appends a new version and makes it head; earlier
//! versions are kept. A version without content is a delete marker. Plain
//! lookups resolve the head and treat a delete marker as absence, while
//! explicit `version_id` lookups see everything.
//!
//! All mutations run inside a nested transaction, so demoting the previous
//! head, inserting the new one, attaching content and adjusting the bucket
//! size either all happen or none do. The schema's partial unique index on
//! `(bucket_id, key) WHERE is_head = 1` stops two concurrent writers from
//! both installing a head.
//!
//! Streamed content is written to the backend before that transaction
//! opens, so a slow upload never holds the database write lock. Bytes whose
//! transaction fails are deleted again.

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use sqlx::SqliteConnection;
use std::io;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    db::begin_write,
    errors::{StorageError, StorageResult, map_unique},
    models::{bucket::Bucket, file_instance::FileInstance, object_version::ObjectVersion},
    services::{
        bucket_manager::BucketManager,
        file_instance_store::{FileInstanceStore, StagedContent},
    },
    storage::ProgressCallback,
};

/// Longest accepted object key, in characters.
pub const MAX_KEY_LEN: usize = 255;

const VERSION_COLUMNS: &str =
    "bucket_id, key, version_id, file_id, mimetype, is_head, created, updated";

/// Demote the current head of `key` (if any) and insert a fresh head version.
///
/// Callers are responsible for key validation, lock checks and size
/// bookkeeping.
pub(crate) async fn insert_version(
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
    key: &str,
    file_id: Option<Uuid>,
    mimetype: Option<&str>,
) -> StorageResult<ObjectVersion> {
    let mut tx = begin_write(conn).await?;
    let now = Utc::now();

    let demoted = sqlx::query(
        "UPDATE object_versions SET is_head = 0, updated = ?
         WHERE bucket_id = ? AND key = ? AND is_head = 1",
    )
    .bind(now)
    .bind(bucket_id)
    .bind(key)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let version = ObjectVersion {
        bucket_id,
        key: key.to_string(),
        version_id: Uuid::new_v4(),
        file_id,
        mimetype_override: mimetype.map(String::from),
        is_head: true,
        created: now,
        updated: now,
    };

    sqlx::query(
        "INSERT INTO object_versions (bucket_id, key, version_id, file_id, mimetype, is_head,
                                      created, updated)
         VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(version.bucket_id)
    .bind(&version.key)
    .bind(version.version_id)
    .bind(version.file_id)
    .bind(&version.mimetype_override)
    .bind(version.created)
    .bind(version.updated)
    .execute(&mut *tx)
    .await
    .map_err(|err| {
        map_unique(
            err,
            format!("another head was installed for `{}` in bucket `{}`", key, bucket_id),
        )
    })?;

    tx.commit().await?;
    debug!(
        "new head {} for {}:{} (demoted {})",
        version.version_id, bucket_id, key, demoted
    );
    Ok(version)
}

/// A writable bucket together with the storage root its new content goes to.
#[derive(Debug, Clone)]
pub(crate) struct UploadTarget {
    bucket: Bucket,
    root: String,
}

#[derive(Clone)]
pub struct ObjectVersionIndex {
    buckets: BucketManager,
    files: FileInstanceStore,
}

impl ObjectVersionIndex {
    pub fn new(buckets: BucketManager, files: FileInstanceStore) -> Self {
        Self { buckets, files }
    }

    fn ensure_key_valid(key: &str) -> StorageResult<()> {
        let len = key.chars().count();
        if len == 0 || len > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey(format!(
                "key must be between 1 and {} characters, got {}",
                MAX_KEY_LEN, len
            )));
        }
        Ok(())
    }

    /// Fetch a bucket that is about to be mutated, rejecting locked ones.
    async fn writable_bucket(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
    ) -> StorageResult<Bucket> {
        let bucket = self.buckets.fetch(conn, bucket_id).await?;
        if bucket.locked {
            return Err(StorageError::BucketLocked(bucket_id));
        }
        Ok(bucket)
    }

    /// Create a new head version for `key` without content.
    ///
    /// Until content is attached the version acts as a delete marker.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<ObjectVersion> {
        self.create_version(conn, bucket_id, key, None, None).await
    }

    /// Create a new head version and stream its content in one step.
    pub async fn create_from_stream<S>(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        content: S,
        size_hint: Option<u64>,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<ObjectVersion>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let target = self.upload_target(conn, bucket_id, key).await?;
        let staged = self.stage(&target, content, size_hint, progress).await?;
        self.create_from_staged(conn, &target, key, &staged, None).await
    }

    /// Check that `key` may be written in `bucket_id` and resolve where its
    /// content goes.
    pub(crate) async fn upload_target(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<UploadTarget> {
        Self::ensure_key_valid(key)?;
        let bucket = self.writable_bucket(conn, bucket_id).await?;
        let root = self.buckets.location(conn, &bucket).await?.uri;
        Ok(UploadTarget { bucket, root })
    }

    /// Write content for a new file instance to the target's location.
    ///
    /// Touches no database connection. The bucket's limits as of
    /// [`upload_target`](Self::upload_target) cut the stream off early.
    pub(crate) async fn stage<S>(
        &self,
        target: &UploadTarget,
        content: S,
        size_hint: Option<u64>,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<StagedContent>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.files
            .stage(
                Uuid::new_v4(),
                &target.root,
                content,
                size_hint,
                target.bucket.size_limit(),
                progress,
            )
            .await
    }

    /// Record staged content as a new head version of `key`.
    ///
    /// Lock and limits are checked again inside the transaction. The staged
    /// bytes are deleted when anything fails, commit included.
    pub(crate) async fn create_from_staged(
        &self,
        conn: &mut SqliteConnection,
        target: &UploadTarget,
        key: &str,
        staged: &StagedContent,
        mimetype: Option<&str>,
    ) -> StorageResult<ObjectVersion> {
        let bucket = &target.bucket;
        let created = async {
            let mut tx = begin_write(conn).await?;
            let file = self
                .files
                .create_staged(&mut tx, staged, Some(&bucket.default_storage_class))
                .await?;
            let version = self
                .create_version(&mut tx, bucket.id, key, Some(&file), mimetype)
                .await?;
            tx.commit().await?;
            Ok::<_, StorageError>(version)
        }
        .await;

        if created.is_err() {
            self.files.discard_bytes(&staged.uri).await;
        }
        created
    }

    /// Create a new head version referencing an existing file instance.
    ///
    /// No bytes are copied; the bucket grows by the instance's size.
    pub async fn create_from_file(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        file_id: Uuid,
    ) -> StorageResult<ObjectVersion> {
        let mut tx = begin_write(conn).await?;
        let file = self.files.fetch(&mut tx, file_id).await?;
        let version = self
            .create_version(&mut tx, bucket_id, key, Some(&file), None)
            .await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn create_version(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        file: Option<&FileInstance>,
        mimetype: Option<&str>,
    ) -> StorageResult<ObjectVersion> {
        Self::ensure_key_valid(key)?;
        let mut tx = begin_write(conn).await?;
        let bucket = self.writable_bucket(&mut tx, bucket_id).await?;
        if let Some(file) = file {
            BucketManager::ensure_within_limits(&bucket, file.size)?;
        }

        let version = insert_version(&mut tx, bucket_id, key, file.map(|f| f.id), mimetype).await?;
        if let Some(file) = file {
            self.buckets.adjust_size(&mut tx, bucket_id, file.size).await?;
        }
        tx.commit().await?;
        Ok(version)
    }

    /// Resolve a version of `key`.
    ///
    /// Without `version_id` this is the head, or `None` when the head is a
    /// delete marker. With `version_id` the exact version is returned
    /// regardless of head or deletion status.
    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
    ) -> StorageResult<Option<ObjectVersion>> {
        let version = match version_id {
            Some(version_id) => {
                sqlx::query_as::<_, ObjectVersion>(&format!(
                    "SELECT {VERSION_COLUMNS} FROM object_versions
                     WHERE bucket_id = ? AND key = ? AND version_id = ?"
                ))
                .bind(bucket_id)
                .bind(key)
                .bind(version_id)
                .fetch_optional(&mut *conn)
                .await?
            }
            None => {
                sqlx::query_as::<_, ObjectVersion>(&format!(
                    "SELECT {VERSION_COLUMNS} FROM object_versions
                     WHERE bucket_id = ? AND key = ? AND is_head = 1 AND file_id IS NOT NULL"
                ))
                .bind(bucket_id)
                .bind(key)
                .fetch_optional(&mut *conn)
                .await?
            }
        };
        Ok(version)
    }

    /// Every version of `key`, newest first.
    pub async fn get_versions(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<Vec<ObjectVersion>> {
        let versions = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions
             WHERE bucket_id = ? AND key = ?
             ORDER BY rowid DESC"
        ))
        .bind(bucket_id)
        .bind(key)
        .fetch_all(&mut *conn)
        .await?;
        Ok(versions)
    }

    /// List a bucket.
    ///
    /// With `versions = false`: one live head per key, delete markers
    /// excluded, ordered by key ascending. With `versions = true`: every
    /// version including delete markers, ordered by key ascending and then
    /// newest first within a key.
    pub async fn get_by_bucket(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        versions: bool,
    ) -> StorageResult<Vec<ObjectVersion>> {
        let sql = if versions {
            format!(
                "SELECT {VERSION_COLUMNS} FROM object_versions
                 WHERE bucket_id = ?
                 ORDER BY key ASC, rowid DESC"
            )
        } else {
            format!(
                "SELECT {VERSION_COLUMNS} FROM object_versions
                 WHERE bucket_id = ? AND is_head = 1 AND file_id IS NOT NULL
                 ORDER BY key ASC"
            )
        };
        let rows = sqlx::query_as::<_, ObjectVersion>(&sql)
            .bind(bucket_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows)
    }

    /// Every version, in any bucket, referencing `file_id`.
    pub async fn get_by_file(
        &self,
        conn: &mut SqliteConnection,
        file_id: Uuid,
    ) -> StorageResult<Vec<ObjectVersion>> {
        let rows = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions WHERE file_id = ? ORDER BY rowid ASC"
        ))
        .bind(file_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    /// Soft-delete `key` by installing a delete marker as its head.
    ///
    /// Earlier versions stay retrievable by version id.
    pub async fn delete(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<ObjectVersion> {
        let marker = self.create_version(conn, bucket_id, key, None, None).await?;
        info!("delete marker {} for {}:{}", marker.version_id, bucket_id, key);
        Ok(marker)
    }

    /// Copy `source` as a new head under `target_key` in `target_bucket`,
    /// defaulting to the source's own bucket and key.
    ///
    /// The copy references the same file instance; no bytes move.
    pub async fn copy(
        &self,
        conn: &mut SqliteConnection,
        source: &ObjectVersion,
        target_bucket: Option<Uuid>,
        target_key: Option<&str>,
    ) -> StorageResult<ObjectVersion> {
        let file_id = source.file_id.ok_or_else(|| {
            StorageError::InvalidOperation(format!(
                "version `{}` is a delete marker and has no content to copy",
                source.version_id
            ))
        })?;
        let mut tx = begin_write(conn).await?;
        let file = self.files.fetch(&mut tx, file_id).await?;
        let copy = self
            .create_version(
                &mut tx,
                target_bucket.unwrap_or(source.bucket_id),
                target_key.unwrap_or(&source.key),
                Some(&file),
                source.mimetype_override.as_deref(),
            )
            .await?;
        tx.commit().await?;
        Ok(copy)
    }

    /// Make the content of `version` current again as a new head of its key.
    pub async fn restore(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
    ) -> StorageResult<ObjectVersion> {
        if version.is_delete_marker() {
            return Err(StorageError::InvalidOperation(format!(
                "version `{}` is a delete marker and cannot be restored",
                version.version_id
            )));
        }
        self.copy(conn, version, None, None).await
    }

    /// Point every version referencing `old_file` at `new_file` instead.
    ///
    /// A pure reference swap: bucket sizes are not adjusted and content is
    /// not verified. Returns the number of versions repointed.
    pub async fn relink_all(
        &self,
        conn: &mut SqliteConnection,
        old_file: Uuid,
        new_file: Uuid,
    ) -> StorageResult<u64> {
        let relinked = sqlx::query(
            "UPDATE object_versions SET file_id = ?, updated = ? WHERE file_id = ?",
        )
        .bind(new_file)
        .bind(Utc::now())
        .bind(old_file)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        info!("relinked {} versions from file {} to {}", relinked, old_file, new_file);
        Ok(relinked)
    }

    /// Attach a freshly created file instance recording content at `uri`.
    pub async fn set_location(
        &self,
        conn: &mut SqliteConnection,
        version: &mut ObjectVersion,
        uri: &str,
        size: i64,
        checksum: &str,
    ) -> StorageResult<()> {
        if version.file_id.is_some() {
            return Err(StorageError::FileInstanceAlreadySet);
        }
        let mut tx = begin_write(conn).await?;
        let mut file = self.files.create(&mut tx).await?;
        self.files
            .set_uri(&mut tx, &mut file, uri, size, checksum)
            .await?;
        self.attach(&mut tx, version, &file).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Attach an existing file instance.
    pub async fn set_file(
        &self,
        conn: &mut SqliteConnection,
        version: &mut ObjectVersion,
        file: &FileInstance,
    ) -> StorageResult<()> {
        if version.file_id.is_some() {
            return Err(StorageError::FileInstanceAlreadySet);
        }
        let mut tx = begin_write(conn).await?;
        let file = self.files.fetch(&mut tx, file.id).await?;
        self.attach(&mut tx, version, &file).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create a file instance under the bucket's location, stream `content`
    /// into it and attach it.
    pub async fn set_contents<S>(
        &self,
        conn: &mut SqliteConnection,
        version: &mut ObjectVersion,
        content: S,
        size_hint: Option<u64>,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        if version.file_id.is_some() {
            return Err(StorageError::FileInstanceAlreadySet);
        }
        let target = self
            .upload_target(conn, version.bucket_id, &version.key)
            .await?;
        let staged = self.stage(&target, content, size_hint, progress).await?;

        let mut attached = version.clone();
        let result = async {
            let mut tx = begin_write(conn).await?;
            let file = self
                .files
                .create_staged(&mut tx, &staged, Some(&target.bucket.default_storage_class))
                .await?;
            self.attach(&mut tx, &mut attached, &file).await?;
            tx.commit().await?;
            Ok::<_, StorageError>(())
        }
        .await;

        match result {
            Ok(()) => {
                *version = attached;
                Ok(())
            }
            Err(err) => {
                self.files.discard_bytes(&staged.uri).await;
                Err(err)
            }
        }
    }

    /// Persist a MIME type override for `version`.
    pub async fn set_mimetype(
        &self,
        conn: &mut SqliteConnection,
        version: &mut ObjectVersion,
        mimetype: &str,
    ) -> StorageResult<()> {
        let mut tx = begin_write(conn).await?;
        self.writable_bucket(&mut tx, version.bucket_id).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE object_versions SET mimetype = ?, updated = ?
             WHERE bucket_id = ? AND key = ? AND version_id = ?",
        )
        .bind(mimetype)
        .bind(now)
        .bind(version.bucket_id)
        .bind(&version.key)
        .bind(version.version_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        version.mimetype_override = Some(mimetype.to_string());
        version.updated = now;
        Ok(())
    }

    /// Permanently delete one version.
    ///
    /// Its content is detached from the bucket size. When it was the head,
    /// the newest remaining version of the key becomes head.
    pub async fn remove(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
    ) -> StorageResult<()> {
        let mut tx = begin_write(conn).await?;
        self.writable_bucket(&mut tx, version.bucket_id).await?;

        let removed = sqlx::query_as::<_, (Option<Uuid>, bool)>(
            "DELETE FROM object_versions
             WHERE bucket_id = ? AND key = ? AND version_id = ?
             RETURNING file_id, is_head",
        )
        .bind(version.bucket_id)
        .bind(&version.key)
        .bind(version.version_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((file_id, was_head)) = removed else {
            return Err(StorageError::ObjectNotFound {
                bucket: version.bucket_id,
                key: version.key.clone(),
            });
        };

        if let Some(file_id) = file_id {
            let file = self.files.fetch(&mut tx, file_id).await?;
            self.buckets
                .adjust_size(&mut tx, version.bucket_id, -file.size)
                .await?;
        }

        if was_head {
            sqlx::query(
                "UPDATE object_versions SET is_head = 1, updated = ?
                 WHERE rowid = (SELECT rowid FROM object_versions
                                WHERE bucket_id = ? AND key = ?
                                ORDER BY rowid DESC LIMIT 1)",
            )
            .bind(Utc::now())
            .bind(version.bucket_id)
            .bind(&version.key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!("removed version {}", version);
        Ok(())
    }

    /// Point a content-less version at `file` and grow the bucket accordingly.
    async fn attach(
        &self,
        conn: &mut SqliteConnection,
        version: &mut ObjectVersion,
        file: &FileInstance,
    ) -> StorageResult<()> {
        let bucket = self.writable_bucket(conn, version.bucket_id).await?;
        BucketManager::ensure_within_limits(&bucket, file.size)?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE object_versions SET file_id = ?, updated = ?
             WHERE bucket_id = ? AND key = ? AND version_id = ? AND file_id IS NULL",
        )
        .bind(file.id)
        .bind(now)
        .bind(version.bucket_id)
        .bind(&version.key)
        .bind(version.version_id)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::FileInstanceAlreadySet);
        }
        self.buckets
            .adjust_size(conn, version.bucket_id, file.size)
            .await?;

        version.file_id = Some(file.id);
        version.updated = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::is_unique_violation,
        services::{
            bucket_manager::NewBucket,
            file_instance_store::WriteOptions,
            testing::{Fixture, body},
        },
    };
    use futures::{StreamExt, stream};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    async fn bucket(fx: &mut Fixture) -> Bucket {
        fx.buckets.create(&mut fx.conn, NewBucket::default()).await.unwrap()
    }

    async fn bucket_size(fx: &mut Fixture, id: Uuid) -> i64 {
        fx.buckets.fetch(&mut fx.conn, id).await.unwrap().size
    }

    #[tokio::test]
    async fn new_version_demotes_previous_head() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;

        let mut obj1 = fx.objects.create(&mut fx.conn, b.id, "test").await.unwrap();
        assert_eq!(obj1.bucket_id, b.id);
        assert_eq!(obj1.key, "test");
        assert!(obj1.file_id.is_none());
        assert!(obj1.is_head);
        fx.objects
            .set_location(&mut fx.conn, &mut obj1, "file:///tmp/obj1", 1, "checksum")
            .await
            .unwrap();

        let mut obj2 = fx.objects.create(&mut fx.conn, b.id, "test").await.unwrap();
        assert_ne!(obj2.version_id, obj1.version_id);
        assert!(obj2.is_head);
        fx.objects
            .set_location(&mut fx.conn, &mut obj2, "file:///tmp/obj2", 2, "checksum")
            .await
            .unwrap();

        let obj3 = fx.objects.create(&mut fx.conn, b.id, "deleted_obj").await.unwrap();

        assert_eq!(
            obj1.to_string(),
            format!("{}:{}:{}", obj1.bucket_id, obj1.version_id, obj1.key)
        );
        assert_eq!(fx.count("object_versions").await, 3);

        let old = fx
            .objects
            .get(&mut fx.conn, b.id, "test", Some(obj1.version_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!old.is_head);
        let new = fx
            .objects
            .get(&mut fx.conn, b.id, "test", Some(obj2.version_id))
            .await
            .unwrap()
            .unwrap();
        assert!(new.is_head);
        let latest = fx.objects.get(&mut fx.conn, b.id, "test", None).await.unwrap().unwrap();
        assert_eq!(latest.version_id, obj2.version_id);

        assert!(fx.objects.get(&mut fx.conn, b.id, "deleted_obj", None).await.unwrap().is_none());
        assert_eq!(
            fx.objects
                .get(&mut fx.conn, b.id, "deleted_obj", Some(obj3.version_id))
                .await
                .unwrap(),
            Some(obj3)
        );

        let heads: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM object_versions
             WHERE bucket_id = ? AND key = 'test' AND is_head = 1",
        )
        .bind(b.id)
        .fetch_one(&mut fx.conn)
        .await
        .unwrap();
        assert_eq!(heads, 1);
    }

    #[tokio::test]
    async fn create_from_file_shares_content_and_grows_bucket() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let obj = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "test", body(b"test"), None, None)
            .await
            .unwrap();
        assert_eq!(bucket_size(&mut fx, b.id).await, 4);

        let dup = fx
            .objects
            .create_from_file(&mut fx.conn, b.id, "test", obj.file_id.unwrap())
            .await
            .unwrap();
        assert_eq!(dup.file_id, obj.file_id);
        assert_eq!(bucket_size(&mut fx, b.id).await, 8);
        assert_eq!(fx.count("files").await, 1);
    }

    #[tokio::test]
    async fn same_key_in_two_buckets() {
        let mut fx = Fixture::new().await;
        let b1 = bucket(&mut fx).await;
        let b2 = bucket(&mut fx).await;
        let obj1 = fx.put(b1.id, "test", "file:///tmp/obj1").await;
        let obj2 = fx.put(b2.id, "test", "file:///tmp/obj2").await;
        assert_eq!(fx.count("object_versions").await, 2);

        let head1 = fx.objects.get(&mut fx.conn, b1.id, "test", None).await.unwrap().unwrap();
        assert!(head1.is_head);
        assert_eq!(head1.version_id, obj1.version_id);
        let head2 = fx.objects.get(&mut fx.conn, b2.id, "test", None).await.unwrap().unwrap();
        assert!(head2.is_head);
        assert_eq!(head2.version_id, obj2.version_id);
    }

    #[tokio::test]
    async fn listing_order() {
        let mut fx = Fixture::new().await;
        let b1 = bucket(&mut fx).await;
        let b2 = bucket(&mut fx).await;
        let first = fx.put(b1.id, "test", "b1test1").await;
        let intermediate = fx.put(b1.id, "test", "b1test2").await;
        let latest = fx.put(b1.id, "test", "b1test3").await;
        fx.put(b1.id, "another", "b1another1").await;
        fx.put(b2.id, "test", "b2test1").await;
        assert_eq!(fx.count("object_versions").await, 5);

        let heads = fx.objects.get_by_bucket(&mut fx.conn, b1.id, false).await.unwrap();
        assert_eq!(
            heads.iter().map(|v| v.key.as_str()).collect::<Vec<_>>(),
            vec!["another", "test"]
        );
        assert_eq!(heads[1].version_id, latest.version_id);
        assert_eq!(fx.objects.get_by_bucket(&mut fx.conn, b2.id, false).await.unwrap().len(), 1);
        assert_eq!(fx.objects.get_by_bucket(&mut fx.conn, b2.id, true).await.unwrap().len(), 1);

        let all = fx.objects.get_by_bucket(&mut fx.conn, b1.id, true).await.unwrap();
        let order: Vec<_> = all.iter().map(|v| (v.key.as_str(), v.version_id)).collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0].0, "another");
        assert_eq!(order[1], ("test", latest.version_id));
        assert_eq!(order[2], ("test", intermediate.version_id));
        assert_eq!(order[3], ("test", first.version_id));
    }

    #[tokio::test]
    async fn delete_then_recreate() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        fx.put(b.id, "test", "b1test1").await;
        fx.put(b.id, "test", "b1test2").await;
        let marker = fx.objects.delete(&mut fx.conn, b.id, "test").await.unwrap();

        assert_eq!(fx.count("object_versions").await, 3);
        assert!(fx.objects.get(&mut fx.conn, b.id, "test", None).await.unwrap().is_none());
        assert!(fx.objects.get_by_bucket(&mut fx.conn, b.id, false).await.unwrap().is_empty());

        let stored = fx
            .objects
            .get(&mut fx.conn, b.id, "test", Some(marker.version_id))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_delete_marker());
        assert!(stored.is_head);

        fx.put(b.id, "test", "b1test4").await;
        assert_eq!(fx.count("object_versions").await, 4);
        assert!(fx.objects.get(&mut fx.conn, b.id, "test", None).await.unwrap().is_some());
        assert_eq!(fx.objects.get_by_bucket(&mut fx.conn, b.id, false).await.unwrap().len(), 1);

        let history = fx.objects.get_versions(&mut fx.conn, b.id, "test").await.unwrap();
        let markers: Vec<bool> = history.iter().map(|v| v.is_delete_marker()).collect();
        assert_eq!(markers, vec![false, true, false, false]);
    }

    #[tokio::test]
    async fn set_contents_attaches_once() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let mut obj = fx.objects.create(&mut fx.conn, b.id, "LICENSE").await.unwrap();
        assert_eq!(fx.count("files").await, 0);

        fx.objects
            .set_contents(&mut fx.conn, &mut obj, body(b"license text"), None, None)
            .await
            .unwrap();
        let file = fx.files.fetch(&mut fx.conn, obj.file_id.unwrap()).await.unwrap();
        assert!(file.uri.is_some());
        assert_eq!(file.size, 12);
        assert!(file.checksum.is_some());
        assert_eq!(file.storage_class.as_deref(), Some("S"));
        assert_eq!(bucket_size(&mut fx, b.id).await, 12);

        assert!(matches!(
            fx.objects.set_contents(&mut fx.conn, &mut obj, body(b"again"), None, None).await,
            Err(StorageError::FileInstanceAlreadySet)
        ));

        let mut obj2 = fx.objects.create(&mut fx.conn, b.id, "LICENSE").await.unwrap();
        fx.objects
            .set_contents(&mut fx.conn, &mut obj2, body(b"readme"), None, None)
            .await
            .unwrap();
        let mut file2 = fx.files.fetch(&mut fx.conn, obj2.file_id.unwrap()).await.unwrap();
        assert_ne!(file2.id, file.id);
        assert_ne!(file2.uri, file.uri);
        assert_eq!(bucket_size(&mut fx, b.id).await, 12 + 6);

        assert!(fx.files.verify_checksum(&mut fx.conn, &mut file2).await.unwrap());
        assert_eq!(file2.last_check, Some(true));
    }

    #[tokio::test]
    async fn set_location_attaches_once() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let mut obj = fx.objects.create(&mut fx.conn, b.id, "LICENSE").await.unwrap();
        fx.objects
            .set_location(&mut fx.conn, &mut obj, "b1test1", 1, "achecksum")
            .await
            .unwrap();
        assert_eq!(fx.count("files").await, 1);
        assert!(matches!(
            fx.objects.set_location(&mut fx.conn, &mut obj, "b1test1", 1, "achecksum").await,
            Err(StorageError::FileInstanceAlreadySet)
        ));
        assert_eq!(fx.count("files").await, 1);
    }

    #[tokio::test]
    async fn set_file_attaches_once() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let mut f = fx.files.create(&mut fx.conn).await.unwrap();
        fx.files.set_uri(&mut fx.conn, &mut f, "f1", 1, "mychecksum").await.unwrap();

        let mut obj = fx.objects.create(&mut fx.conn, b.id, "test").await.unwrap();
        fx.objects.set_file(&mut fx.conn, &mut obj, &f).await.unwrap();
        assert_eq!(obj.file_id, Some(f.id));
        assert!(matches!(
            fx.objects.set_file(&mut fx.conn, &mut obj, &f).await,
            Err(StorageError::FileInstanceAlreadySet)
        ));
    }

    #[tokio::test]
    async fn stale_record_cannot_double_attach() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let mut obj = fx.objects.create(&mut fx.conn, b.id, "test").await.unwrap();
        let mut stale = obj.clone();
        fx.objects.set_location(&mut fx.conn, &mut obj, "one", 1, "md5:a").await.unwrap();

        assert!(matches!(
            fx.objects.set_location(&mut fx.conn, &mut stale, "two", 1, "md5:b").await,
            Err(StorageError::FileInstanceAlreadySet)
        ));
        // The losing attempt rolled back its file instance and size change.
        assert_eq!(fx.count("files").await, 1);
        assert_eq!(bucket_size(&mut fx, b.id).await, 1);
    }

    #[tokio::test]
    async fn copy_references_same_file() {
        let mut fx = Fixture::new().await;
        let mut f = fx.files.create(&mut fx.conn).await.unwrap();
        fx.files.set_uri(&mut fx.conn, &mut f, "f1", 1, "mychecksum").await.unwrap();
        let b1 = bucket(&mut fx).await;
        let b2 = bucket(&mut fx).await;

        let marker = fx.objects.create(&mut fx.conn, b1.id, "deleted").await.unwrap();
        assert!(matches!(
            fx.objects.copy(&mut fx.conn, &marker, Some(b2.id), None).await,
            Err(StorageError::InvalidOperation(_))
        ));

        let mut obj = fx.objects.create(&mut fx.conn, b1.id, "selftest").await.unwrap();
        fx.objects.set_file(&mut fx.conn, &mut obj, &f).await.unwrap();
        let copy = fx.objects.copy(&mut fx.conn, &obj, None, None).await.unwrap();
        assert_ne!(copy.version_id, obj.version_id);
        assert_eq!(copy.key, obj.key);
        assert_eq!(copy.bucket_id, obj.bucket_id);
        assert_eq!(copy.file_id, obj.file_id);
        let versions = fx.objects.get_versions(&mut fx.conn, b1.id, "selftest").await.unwrap();
        assert_eq!(versions[0].version_id, copy.version_id);
        assert_eq!(versions[1].version_id, obj.version_id);

        let copy2 = fx.objects.copy(&mut fx.conn, &copy, None, Some("newkeytest")).await.unwrap();
        assert_ne!(copy2.version_id, copy.version_id);
        assert_eq!(copy2.key, "newkeytest");
        assert_eq!(copy2.bucket_id, copy.bucket_id);
        assert_eq!(copy2.file_id, copy.file_id);

        let copy3 = fx.objects.copy(&mut fx.conn, &copy2, Some(b2.id), None).await.unwrap();
        assert_ne!(copy3.version_id, copy2.version_id);
        assert_eq!(copy3.key, copy2.key);
        assert_eq!(copy3.bucket_id, b2.id);
        assert_eq!(copy3.file_id, copy2.file_id);

        assert_eq!(fx.count("files").await, 1);
        assert_eq!(bucket_size(&mut fx, b1.id).await, 3);
        assert_eq!(bucket_size(&mut fx, b2.id).await, 1);
    }

    #[tokio::test]
    async fn mimetype_guess_and_override() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let pdf = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "test.pdf", body(b"pdfdata"), None, None)
            .await
            .unwrap();
        let mut readme = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "README", body(b"pdfdata"), None, None)
            .await
            .unwrap();
        assert_eq!(pdf.mimetype(), "application/pdf");
        assert_eq!(readme.mimetype(), "application/octet-stream");

        fx.objects.set_mimetype(&mut fx.conn, &mut readme, "text/plain").await.unwrap();
        let stored = fx.objects.get(&mut fx.conn, b.id, "README", None).await.unwrap().unwrap();
        assert_eq!(stored.mimetype(), "text/plain");

        let restored = fx.objects.restore(&mut fx.conn, &stored).await.unwrap();
        assert_eq!(restored.mimetype(), "text/plain");
    }

    #[tokio::test]
    async fn restore_previous_content() {
        let mut fx = Fixture::new().await;
        let mut f1 = fx.files.create(&mut fx.conn).await.unwrap();
        fx.files.set_uri(&mut fx.conn, &mut f1, "f1", 1, "mychecksum").await.unwrap();
        let mut f2 = fx.files.create(&mut fx.conn).await.unwrap();
        fx.files.set_uri(&mut fx.conn, &mut f2, "f2", 2, "mychecksum2").await.unwrap();
        let b = bucket(&mut fx).await;

        let mut obj1 = fx.objects.create(&mut fx.conn, b.id, "test").await.unwrap();
        fx.objects.set_file(&mut fx.conn, &mut obj1, &f1).await.unwrap();
        let mut obj2 = fx.objects.create(&mut fx.conn, b.id, "test").await.unwrap();
        fx.objects.set_file(&mut fx.conn, &mut obj2, &f2).await.unwrap();
        let marker = fx.objects.delete(&mut fx.conn, b.id, "test").await.unwrap();
        assert_eq!(fx.count("object_versions").await, 3);

        assert!(matches!(
            fx.objects.restore(&mut fx.conn, &marker).await,
            Err(StorageError::InvalidOperation(_))
        ));

        let restored = fx.objects.restore(&mut fx.conn, &obj1).await.unwrap();
        assert_eq!(fx.count("object_versions").await, 4);
        assert!(restored.is_head);
        assert_ne!(restored.version_id, obj1.version_id);
        assert_eq!(restored.key, obj1.key);
        assert_eq!(restored.file_id, obj1.file_id);
        assert_eq!(restored.bucket_id, obj1.bucket_id);

        let head = fx.objects.get(&mut fx.conn, b.id, "test", None).await.unwrap().unwrap();
        assert_eq!(head.version_id, restored.version_id);
    }

    #[tokio::test]
    async fn relink_all_swaps_references() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let obj = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "relink-test", body(b"relinkthis"), None, None)
            .await
            .unwrap();
        fx.objects
            .create_from_stream(&mut fx.conn, b.id, "do-not-touch", body(b"na"), None, None)
            .await
            .unwrap();
        fx.buckets.snapshot(&mut fx.conn, b.id, false).await.unwrap();
        assert_eq!(fx.count("object_versions").await, 4);
        assert_eq!(fx.count("files").await, 2);

        let old = fx.files.fetch(&mut fx.conn, obj.file_id.unwrap()).await.unwrap();
        let mut fresh = fx.files.create(&mut fx.conn).await.unwrap();
        fx.files
            .copy_contents(&mut fx.conn, &mut fresh, &old, WriteOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(fx.objects.get_by_file(&mut fx.conn, old.id).await.unwrap().len(), 2);
        assert!(fx.objects.get_by_file(&mut fx.conn, fresh.id).await.unwrap().is_empty());

        let sizes_before = (bucket_size(&mut fx, b.id).await, fx.count("buckets").await);
        let moved = fx.objects.relink_all(&mut fx.conn, old.id, fresh.id).await.unwrap();
        assert_eq!(moved, 2);
        assert!(fx.objects.get_by_file(&mut fx.conn, old.id).await.unwrap().is_empty());
        assert_eq!(fx.objects.get_by_file(&mut fx.conn, fresh.id).await.unwrap().len(), 2);
        assert_eq!(sizes_before, (bucket_size(&mut fx, b.id).await, fx.count("buckets").await));
    }

    #[tokio::test]
    async fn key_length_bounds() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        fx.objects.create(&mut fx.conn, b.id, &"x".repeat(255)).await.unwrap();
        assert!(matches!(
            fx.objects.create(&mut fx.conn, b.id, &"x".repeat(256)).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            fx.objects.create(&mut fx.conn, b.id, "").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn locked_bucket_rejects_writes() {
        let mut fx = Fixture::new().await;
        let mut b = bucket(&mut fx).await;
        let existing = fx.put(b.id, "present", "some-uri").await;
        fx.buckets.set_locked(&mut fx.conn, &mut b, true).await.unwrap();

        assert!(matches!(
            fx.objects.create(&mut fx.conn, b.id, "k").await,
            Err(StorageError::BucketLocked(_))
        ));
        assert!(matches!(
            fx.objects.delete(&mut fx.conn, b.id, "present").await,
            Err(StorageError::BucketLocked(_))
        ));
        assert!(matches!(
            fx.objects.remove(&mut fx.conn, &existing).await,
            Err(StorageError::BucketLocked(_))
        ));
        // Readers are unaffected.
        assert!(fx.objects.get(&mut fx.conn, b.id, "present", None).await.unwrap().is_some());

        fx.buckets.set_locked(&mut fx.conn, &mut b, false).await.unwrap();
        fx.objects.create(&mut fx.conn, b.id, "k").await.unwrap();
    }

    #[tokio::test]
    async fn remove_version_detaches_and_promotes() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let first = fx.put(b.id, "k", "u1").await;
        let second = fx.put(b.id, "k", "u2").await;
        assert_eq!(bucket_size(&mut fx, b.id).await, 2);

        fx.objects.remove(&mut fx.conn, &second).await.unwrap();
        assert_eq!(bucket_size(&mut fx, b.id).await, 1);
        let head = fx.objects.get(&mut fx.conn, b.id, "k", None).await.unwrap().unwrap();
        assert_eq!(head.version_id, first.version_id);
        assert!(head.is_head);

        assert!(matches!(
            fx.objects.remove(&mut fx.conn, &second).await,
            Err(StorageError::ObjectNotFound { .. })
        ));

        fx.objects.remove(&mut fx.conn, &head).await.unwrap();
        assert_eq!(bucket_size(&mut fx, b.id).await, 0);
        assert!(fx.objects.get_versions(&mut fx.conn, b.id, "k").await.unwrap().is_empty());
        // Files are never removed with their versions.
        assert_eq!(fx.count("files").await, 2);
    }

    #[tokio::test]
    async fn size_limits_reject_and_roll_back() {
        let mut fx = Fixture::new().await;
        let b = fx
            .buckets
            .create(
                &mut fx.conn,
                NewBucket { quota_size: Some(10), max_file_size: Some(6), ..Default::default() },
            )
            .await
            .unwrap();

        let err = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "big", body(b"seven b"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::FileSizeLimitExceeded { size: 7, limit: 6 }));
        assert_eq!(fx.count("object_versions").await, 0);
        assert_eq!(fx.count("files").await, 0);
        assert_eq!(bucket_size(&mut fx, b.id).await, 0);

        fx.objects
            .create_from_stream(&mut fx.conn, b.id, "a", body(b"123456"), None, None)
            .await
            .unwrap();
        let err = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "b", body(b"12345"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 10 }));
        assert_eq!(bucket_size(&mut fx, b.id).await, 6);
        assert_eq!(fx.count("object_versions").await, 1);
    }

    #[tokio::test]
    async fn bucket_size_tracks_attached_content() {
        let mut fx = Fixture::new().await;
        let b1 = bucket(&mut fx).await;
        let b2 = bucket(&mut fx).await;

        let a = fx
            .objects
            .create_from_stream(&mut fx.conn, b1.id, "a", body(b"aaaa"), None, None)
            .await
            .unwrap();
        fx.objects
            .create_from_stream(&mut fx.conn, b1.id, "a", body(b"aa"), None, None)
            .await
            .unwrap();
        fx.objects.delete(&mut fx.conn, b1.id, "a").await.unwrap();
        fx.objects.copy(&mut fx.conn, &a, Some(b2.id), Some("copied")).await.unwrap();
        fx.objects.restore(&mut fx.conn, &a).await.unwrap();
        fx.buckets.snapshot(&mut fx.conn, b1.id, false).await.unwrap();
        let doomed = fx.put(b2.id, "tmp", "tmp-uri").await;
        fx.objects.remove(&mut fx.conn, &doomed).await.unwrap();

        let drift: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM buckets b
             WHERE b.size != (SELECT COALESCE(SUM(f.size), 0)
                              FROM object_versions ov JOIN files f ON f.id = ov.file_id
                              WHERE ov.bucket_id = b.id)",
        )
        .fetch_one(&mut fx.conn)
        .await
        .unwrap();
        assert_eq!(drift, 0);
        assert_eq!(bucket_size(&mut fx, b1.id).await, 4 + 2 + 4);
        assert_eq!(bucket_size(&mut fx, b2.id).await, 4);
    }

    #[tokio::test]
    async fn head_index_rejects_a_second_head() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        fx.objects.create(&mut fx.conn, b.id, "k").await.unwrap();

        let now = Utc::now();
        let err = sqlx::query(
            "INSERT INTO object_versions (bucket_id, key, version_id, file_id, mimetype, is_head,
                                          created, updated)
             VALUES (?, 'k', ?, NULL, NULL, 1, ?, ?)",
        )
        .bind(b.id)
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(now)
        .execute(&mut fx.conn)
        .await
        .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn oversized_stream_is_cut_off_early() {
        let mut fx = Fixture::new().await;
        let b = fx
            .buckets
            .create(
                &mut fx.conn,
                NewBucket {
                    max_file_size: Some(8),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let endless = stream::repeat(()).map(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"four"))
        });
        let err = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "huge", endless, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::FileSizeLimitExceeded { size: 12, limit: 8 }));
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        assert_eq!(fx.count("object_versions").await, 0);
        assert_eq!(fx.count("files").await, 0);
        assert_eq!(fx.stored_files(), 0);
    }

    #[tokio::test]
    async fn rejected_attach_discards_streamed_bytes() {
        let mut fx = Fixture::new().await;
        let b = bucket(&mut fx).await;
        let mut obj = fx.objects.create(&mut fx.conn, b.id, "k").await.unwrap();
        let mut stale = obj.clone();
        fx.objects
            .set_contents(&mut fx.conn, &mut obj, body(b"winner"), None, None)
            .await
            .unwrap();
        assert_eq!(fx.stored_files(), 1);

        let err = fx
            .objects
            .set_contents(&mut fx.conn, &mut stale, body(b"loser"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::FileInstanceAlreadySet));
        assert!(stale.file_id.is_none());
        assert_eq!(fx.count("files").await, 1);
        assert_eq!(fx.stored_files(), 1);
        assert_eq!(bucket_size(&mut fx, b.id).await, 6);
    }

    #[tokio::test]
    async fn locked_bucket_rejects_streams_before_reading() {
        let mut fx = Fixture::new().await;
        let mut b = bucket(&mut fx).await;
        fx.buckets.set_locked(&mut fx.conn, &mut b, true).await.unwrap();

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let content = stream::iter(vec![Ok(Bytes::from_static(b"data"))]).map(move |chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
            chunk
        });
        let err = fx
            .objects
            .create_from_stream(&mut fx.conn, b.id, "k", content, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketLocked(_)));
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert_eq!(fx.stored_files(), 0);
    }
}
