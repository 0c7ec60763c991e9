//! Shared fixture for service tests: an in-memory database with the schema
//! applied and a default location rooted in a temporary directory.

use bytes::Bytes;
use futures::{StreamExt, stream};
use sqlx::SqliteConnection;
use std::{path::Path, sync::Arc};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    config::StorageClassConfig,
    db::memory_connection,
    models::object_version::ObjectVersion,
    services::{
        bucket_manager::BucketManager, bucket_tag_store::BucketTagStore,
        file_instance_store::FileInstanceStore, location_registry::LocationRegistry,
        object_version_index::ObjectVersionIndex,
    },
    storage::{ByteStream, LocalFsBackend},
};

pub(crate) struct Fixture {
    pub conn: SqliteConnection,
    pub root: String,
    pub locations: LocationRegistry,
    pub buckets: BucketManager,
    pub files: FileInstanceStore,
    pub objects: ObjectVersionIndex,
    pub tags: BucketTagStore,
    _dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        let mut conn = memory_connection().await;
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = format!("file://{}", dir.path().display());

        let locations = LocationRegistry::new();
        locations
            .create(&mut conn, "default", &root, true)
            .await
            .expect("register default location");

        let buckets = BucketManager::new(StorageClassConfig::default());
        let files = FileInstanceStore::new(Arc::new(LocalFsBackend::new()));
        let objects = ObjectVersionIndex::new(buckets.clone(), files.clone());

        Self {
            conn,
            root,
            locations,
            buckets,
            files,
            objects,
            tags: BucketTagStore::new(),
            _dir: dir,
        }
    }

    /// Row count of `table`.
    pub async fn count(&mut self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut self.conn)
            .await
            .expect("count rows")
    }

    /// Files written under the default location, temporaries included.
    pub fn stored_files(&self) -> usize {
        fn walk(dir: &Path) -> usize {
            std::fs::read_dir(dir)
                .expect("read storage dir")
                .map(|entry| entry.expect("read dir entry").path())
                .map(|path| if path.is_dir() { walk(&path) } else { 1 })
                .sum()
        }
        walk(self._dir.path())
    }

    /// Create a version of `key` pointing at a one-byte fake location.
    pub async fn put(&mut self, bucket_id: Uuid, key: &str, uri: &str) -> ObjectVersion {
        let mut version = self
            .objects
            .create(&mut self.conn, bucket_id, key)
            .await
            .expect("create version");
        self.objects
            .set_location(&mut self.conn, &mut version, uri, 1, "md5:achecksum")
            .await
            .expect("set location");
        version
    }
}

pub(crate) fn body(data: &'static [u8]) -> ByteStream<'static> {
    stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
}
