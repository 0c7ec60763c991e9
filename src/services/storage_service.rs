//! src/services/storage_service.rs
//!
//! StorageService — the API-level facade over the metadata engine. Each
//! public write opens one `BEGIN IMMEDIATE` transaction on the shared SQLite
//! pool, composes the component services inside it and commits only when
//! every step succeeded. Uploads are the exception: their bytes are streamed
//! before the transaction that records them begins.

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::{collections::BTreeMap, io, path::PathBuf, sync::Arc};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::StorageClassConfig,
    errors::{StorageError, StorageResult},
    mimetype,
    models::{
        bucket::Bucket, bucket_tag::BucketTag, file_instance::FileInstance, location::Location,
        object_version::ObjectVersion,
    },
    services::{
        bucket_manager::{BucketManager, NewBucket},
        bucket_tag_store::BucketTagStore,
        file_instance_store::FileInstanceStore,
        location_registry::LocationRegistry,
        object_version_index::ObjectVersionIndex,
    },
    storage::{ContentReader, StorageBackend},
};

/// A version together with the content facts clients care about.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ObjectMeta {
    #[serde(flatten)]
    pub version: ObjectVersion,
    pub mimetype: String,
    pub size: i64,
    pub checksum: Option<String>,
}

impl ObjectMeta {
    fn new(version: ObjectVersion, file: Option<&FileInstance>) -> Self {
        Self {
            mimetype: version.mimetype(),
            size: file.map_or(0, |f| f.size),
            checksum: file.and_then(|f| f.checksum.clone()),
            version,
        }
    }
}

/// Where a copy lands; unset fields default to the source's bucket and key.
#[derive(Debug, Clone, Default)]
pub struct CopyTarget {
    pub bucket: Option<Uuid>,
    pub key: Option<String>,
}

#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Directory backing the default location; probed by readiness checks.
    pub base_path: PathBuf,

    locations: LocationRegistry,
    buckets: BucketManager,
    files: FileInstanceStore,
    objects: ObjectVersionIndex,
    tags: BucketTagStore,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        backend: Arc<dyn StorageBackend>,
        storage_classes: StorageClassConfig,
    ) -> Self {
        let buckets = BucketManager::new(storage_classes);
        let files = FileInstanceStore::new(backend);
        let objects = ObjectVersionIndex::new(buckets.clone(), files.clone());
        Self {
            db,
            base_path: base_path.into(),
            locations: LocationRegistry::new(),
            buckets,
            files,
            objects,
            tags: BucketTagStore::new(),
        }
    }

    /// Register `uri` as the default location `name` unless a default exists.
    pub async fn ensure_default_location(&self, name: &str, uri: &str) -> StorageResult<Location> {
        let mut tx = self.write_tx().await?;
        let location = match self.locations.get_default(&mut tx).await? {
            Some(existing) => existing,
            None => self.locations.create(&mut tx, name, uri, true).await?,
        };
        tx.commit().await?;
        Ok(location)
    }

    pub async fn register_location(
        &self,
        name: &str,
        uri: &str,
        default: bool,
    ) -> StorageResult<Location> {
        let mut tx = self.write_tx().await?;
        let location = self.locations.create(&mut tx, name, uri, default).await?;
        tx.commit().await?;
        Ok(location)
    }

    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let mut conn = self.db.acquire().await?;
        self.buckets.all(&mut conn).await
    }

    pub async fn create_bucket(&self, params: NewBucket) -> StorageResult<Bucket> {
        let mut tx = self.write_tx().await?;
        let bucket = self.buckets.create(&mut tx, params).await?;
        tx.commit().await?;
        Ok(bucket)
    }

    pub async fn get_bucket(&self, id: Uuid) -> StorageResult<Bucket> {
        let mut conn = self.db.acquire().await?;
        self.buckets.fetch(&mut conn, id).await
    }

    /// Remove a bucket with its versions and tags. File instances survive.
    pub async fn delete_bucket(&self, id: Uuid) -> StorageResult<()> {
        let mut tx = self.write_tx().await?;
        self.buckets.remove(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_bucket_locked(&self, id: Uuid, locked: bool) -> StorageResult<Bucket> {
        let mut tx = self.write_tx().await?;
        let mut bucket = self.buckets.fetch(&mut tx, id).await?;
        self.buckets.set_locked(&mut tx, &mut bucket, locked).await?;
        tx.commit().await?;
        Ok(bucket)
    }

    pub async fn snapshot_bucket(&self, id: Uuid, lock: bool) -> StorageResult<Bucket> {
        let mut tx = self.write_tx().await?;
        let snapshot = self.buckets.snapshot(&mut tx, id, lock).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    pub async fn bucket_tags(&self, id: Uuid) -> StorageResult<BTreeMap<String, String>> {
        let mut conn = self.db.acquire().await?;
        self.buckets.fetch(&mut conn, id).await?;
        self.buckets.get_tags(&mut conn, id).await
    }

    pub async fn put_tag(&self, id: Uuid, key: &str, value: &str) -> StorageResult<BucketTag> {
        let mut tx = self.write_tx().await?;
        self.buckets.fetch(&mut tx, id).await?;
        let tag = self.tags.create_or_update(&mut tx, id, key, value).await?;
        tx.commit().await?;
        Ok(tag)
    }

    pub async fn delete_tag(&self, id: Uuid, key: &str) -> StorageResult<()> {
        let mut tx = self.write_tx().await?;
        self.buckets.fetch(&mut tx, id).await?;
        self.tags.delete(&mut tx, id, key).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Heads of every live key, or with `versions` the full history.
    pub async fn list_objects(&self, id: Uuid, versions: bool) -> StorageResult<Vec<ObjectMeta>> {
        let mut conn = self.db.acquire().await?;
        self.buckets.fetch(&mut conn, id).await?;
        let listed = self.objects.get_by_bucket(&mut conn, id, versions).await?;
        let mut out = Vec::with_capacity(listed.len());
        for version in listed {
            out.push(self.describe(&mut conn, version).await?);
        }
        Ok(out)
    }

    /// Stream `content` into a new head version of `key`.
    ///
    /// A `content_type` that differs from what the key implies is stored as
    /// the version's MIME override. The bytes are written before the short
    /// transaction that records them, and deleted again if it fails.
    pub async fn upload_object<S>(
        &self,
        bucket_id: Uuid,
        key: &str,
        content_type: Option<&str>,
        content: S,
        size_hint: Option<u64>,
    ) -> StorageResult<ObjectMeta>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let override_type = content_type.filter(|ct| *ct != mimetype::guess(key));
        let target = {
            let mut conn = self.db.acquire().await?;
            self.objects.upload_target(&mut conn, bucket_id, key).await?
        };
        // No connection is held while the bytes stream in.
        let staged = self.objects.stage(&target, content, size_hint, None).await?;

        let mut conn = match self.db.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                self.files.discard_bytes(&staged.uri).await;
                return Err(err.into());
            }
        };
        let version = self
            .objects
            .create_from_staged(&mut conn, &target, key, &staged, override_type)
            .await?;
        let meta = self.describe(&mut conn, version).await?;

        info!("stored {} ({} bytes)", meta.version, meta.size);
        Ok(meta)
    }

    pub async fn get_object_metadata(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
    ) -> StorageResult<ObjectMeta> {
        let mut conn = self.db.acquire().await?;
        let version = self.resolve(&mut conn, bucket_id, key, version_id).await?;
        self.describe(&mut conn, version).await
    }

    /// Open the content of a version for streaming.
    ///
    /// Delete markers have nothing to read and resolve as not found.
    pub async fn get_object_reader(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
    ) -> StorageResult<(ObjectMeta, ContentReader, u64)> {
        let mut conn = self.db.acquire().await?;
        let version = self.resolve(&mut conn, bucket_id, key, version_id).await?;
        let Some(file_id) = version.file_id else {
            return Err(StorageError::ObjectNotFound {
                bucket: bucket_id,
                key: key.to_string(),
            });
        };
        let file = self.files.fetch(&mut conn, file_id).await?;
        let (reader, length) = self.files.open(&file).await?;
        Ok((ObjectMeta::new(version, Some(&file)), reader, length))
    }

    /// Without `version_id` install a delete marker and return it; with one,
    /// permanently remove that version and return `None`.
    pub async fn delete_object(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
    ) -> StorageResult<Option<ObjectVersion>> {
        let mut tx = self.write_tx().await?;
        let outcome = match version_id {
            None => {
                self.buckets.fetch(&mut tx, bucket_id).await?;
                Some(self.objects.delete(&mut tx, bucket_id, key).await?)
            }
            Some(_) => {
                let version = self.resolve(&mut tx, bucket_id, key, version_id).await?;
                self.objects.remove(&mut tx, &version).await?;
                None
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn copy_object(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
        target: CopyTarget,
    ) -> StorageResult<ObjectMeta> {
        let mut tx = self.write_tx().await?;
        let source = self.resolve(&mut tx, bucket_id, key, version_id).await?;
        let copy = self
            .objects
            .copy(&mut tx, &source, target.bucket, target.key.as_deref())
            .await?;
        let meta = self.describe(&mut tx, copy).await?;
        tx.commit().await?;
        Ok(meta)
    }

    pub async fn restore_object(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Uuid,
    ) -> StorageResult<ObjectMeta> {
        let mut tx = self.write_tx().await?;
        let version = self.resolve(&mut tx, bucket_id, key, Some(version_id)).await?;
        let restored = self.objects.restore(&mut tx, &version).await?;
        let meta = self.describe(&mut tx, restored).await?;
        tx.commit().await?;
        Ok(meta)
    }

    async fn write_tx(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        Ok(self.db.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Look up a version, failing with not-found for a missing bucket or a
    /// key without a live head.
    async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
    ) -> StorageResult<ObjectVersion> {
        self.buckets.fetch(conn, bucket_id).await?;
        self.objects
            .get(conn, bucket_id, key, version_id)
            .await?
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket_id,
                key: key.to_string(),
            })
    }

    async fn describe(
        &self,
        conn: &mut SqliteConnection,
        version: ObjectVersion,
    ) -> StorageResult<ObjectMeta> {
        let file = match version.file_id {
            Some(file_id) => Some(self.files.fetch(conn, file_id).await?),
            None => None,
        };
        Ok(ObjectMeta::new(version, file.as_ref()))
    }
}
