//! FileInstanceStore — physical content records and the operations that move
//! bytes through the [`StorageBackend`].
//!
//! A file instance is created empty and writable. Attaching content (by
//! streaming it, copying it from another instance, or recording an existing
//! URI) makes it readable and read-only; after that its content never changes.

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use sqlx::SqliteConnection;
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    errors::{StorageError, StorageResult, map_unique},
    models::file_instance::FileInstance,
    services::location_registry::LocationRegistry,
    storage::{ContentReader, ProgressCallback, SizeLimit, StorageBackend, StoredContent},
};

pub(crate) const MAX_URI_LEN: usize = 255;

const FILE_COLUMNS: &str = "id, uri, storage_class, size, checksum, readable, writable, \
                            last_check_at, last_check, created, updated";

/// Where and how new content is written.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions<'a> {
    /// Storage root URI; the default location's root when `None`.
    pub default_location: Option<&'a str>,
    pub storage_class: Option<&'a str>,
    /// Expected content length, forwarded to progress callbacks.
    pub size_hint: Option<u64>,
    /// Budget the streamed bytes must fit in; unlimited by default.
    pub limit: SizeLimit,
}

/// Bytes already written to the backend for a file instance whose row does
/// not exist yet.
#[derive(Debug, Clone)]
pub(crate) struct StagedContent {
    pub file_id: Uuid,
    pub uri: String,
    pub stored: StoredContent,
}

#[derive(Clone)]
pub struct FileInstanceStore {
    backend: Arc<dyn StorageBackend>,
    locations: LocationRegistry,
}

impl FileInstanceStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            locations: LocationRegistry::new(),
        }
    }

    /// Insert an empty instance: no URI, size 0, readable = false, writable = true.
    pub async fn create(&self, conn: &mut SqliteConnection) -> StorageResult<FileInstance> {
        let now = Utc::now();
        let file = FileInstance {
            id: Uuid::new_v4(),
            uri: None,
            storage_class: None,
            size: 0,
            checksum: None,
            readable: false,
            writable: true,
            last_check_at: None,
            last_check: None,
            created: now,
            updated: now,
        };

        sqlx::query(
            "INSERT INTO files (id, uri, storage_class, size, checksum, readable, writable,
                                last_check_at, last_check, created, updated)
             VALUES (?, NULL, NULL, 0, NULL, 0, 1, NULL, NULL, ?, ?)",
        )
        .bind(file.id)
        .bind(file.created)
        .bind(file.updated)
        .execute(&mut *conn)
        .await?;

        Ok(file)
    }

    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> StorageResult<Option<FileInstance>> {
        let file = sqlx::query_as::<_, FileInstance>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(file)
    }

    /// Insert a readable, read-only instance for content that was staged
    /// with [`stage`](Self::stage).
    pub(crate) async fn create_staged(
        &self,
        conn: &mut SqliteConnection,
        staged: &StagedContent,
        storage_class: Option<&str>,
    ) -> StorageResult<FileInstance> {
        let now = Utc::now();
        let file = FileInstance {
            id: staged.file_id,
            uri: Some(staged.uri.clone()),
            storage_class: storage_class.map(String::from),
            size: staged.stored.size,
            checksum: Some(staged.stored.checksum.clone()),
            readable: true,
            writable: false,
            last_check_at: None,
            last_check: None,
            created: now,
            updated: now,
        };

        sqlx::query(
            "INSERT INTO files (id, uri, storage_class, size, checksum, readable, writable,
                                last_check_at, last_check, created, updated)
             VALUES (?, ?, ?, ?, ?, 1, 0, NULL, NULL, ?, ?)",
        )
        .bind(file.id)
        .bind(&file.uri)
        .bind(&file.storage_class)
        .bind(file.size)
        .bind(&file.checksum)
        .bind(file.created)
        .bind(file.updated)
        .execute(&mut *conn)
        .await
        .map_err(|err| map_unique(err, format!("URI `{}` is already in use", staged.uri)))?;

        Ok(file)
    }

    /// Like [`get`](Self::get) but a missing instance is an error.
    pub(crate) async fn fetch(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> StorageResult<FileInstance> {
        self.get(conn, id).await?.ok_or(StorageError::FileNotFound(id))
    }

    pub async fn get_by_uri(
        &self,
        conn: &mut SqliteConnection,
        uri: &str,
    ) -> StorageResult<Option<FileInstance>> {
        if uri.is_empty() {
            return Err(StorageError::Precondition(
                "URI lookup requires a non-empty URI".into(),
            ));
        }
        let file = sqlx::query_as::<_, FileInstance>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE uri = ?"
        ))
        .bind(uri)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(file)
    }

    /// Record content that already exists at `uri`.
    pub async fn set_uri(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
        uri: &str,
        size: i64,
        checksum: &str,
    ) -> StorageResult<()> {
        if uri.chars().count() > MAX_URI_LEN {
            return Err(StorageError::Validation(format!(
                "URI longer than {} characters",
                MAX_URI_LEN
            )));
        }
        if file.has_content() || !file.writable {
            return Err(StorageError::FileInstanceAlreadySet);
        }
        let stored = StoredContent {
            size,
            checksum: checksum.to_string(),
        };
        let storage_class = file.storage_class.clone();
        self.record_content(conn, file, uri, &stored, storage_class.as_deref())
            .await
    }

    /// Stream `content` into the backend and attach it to `file`.
    ///
    /// Size and checksum are computed while streaming. Fails with
    /// [`StorageError::FileInstanceAlreadySet`] if `file` already has content.
    pub async fn set_contents<S>(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
        content: S,
        options: WriteOptions<'_>,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        if file.has_content() || !file.writable {
            return Err(StorageError::FileInstanceAlreadySet);
        }
        self.write_content(conn, file, content, options, progress)
            .await
    }

    /// Copy the bytes of `source` into the pristine instance `file`.
    ///
    /// `source` must be readable; `file` must be writable and empty
    /// (`size == 0`). The source record is never modified.
    pub async fn copy_contents(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
        source: &FileInstance,
        options: WriteOptions<'_>,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<()> {
        let source_uri = match (&source.uri, source.readable) {
            (Some(uri), true) => uri.clone(),
            _ => {
                return Err(StorageError::Precondition(format!(
                    "source file `{}` is not readable",
                    source.id
                )));
            }
        };
        if !file.writable {
            return Err(StorageError::Precondition(format!(
                "destination file `{}` is not writable",
                file.id
            )));
        }
        if file.size != 0 || file.has_content() {
            return Err(StorageError::Precondition(format!(
                "destination file `{}` is not empty",
                file.id
            )));
        }

        let reader = self.backend.open(&source_uri).await?;
        let options = WriteOptions {
            default_location: options.default_location,
            storage_class: options.storage_class.or(source.storage_class.as_deref()),
            size_hint: options.size_hint.or(Some(source.size.max(0) as u64)),
            limit: options.limit,
        };
        self.write_content(conn, file, ReaderStream::new(reader), options, progress)
            .await?;

        if file.checksum != source.checksum {
            warn!(
                "copy of {} into {} produced checksum {:?}, source records {:?}",
                source.id, file.id, file.checksum, source.checksum
            );
        }
        Ok(())
    }

    /// Recompute the checksum of the stored bytes and compare it with the
    /// recorded one, persisting when and how the check went.
    ///
    /// The recorded checksum itself is left untouched. When the stored bytes
    /// cannot be hashed at all the attempt is still recorded, with an
    /// unknown outcome, before the backend error is returned.
    pub async fn verify_checksum(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
    ) -> StorageResult<bool> {
        let uri = readable_uri(file)?;
        let actual = match self.backend.checksum(&uri).await {
            Ok(actual) => actual,
            Err(err) => {
                warn!("could not re-hash file {} at {}: {}", file.id, uri, err);
                self.record_check(conn, file, None).await?;
                return Err(err);
            }
        };
        let matches = file.checksum.as_deref() == Some(actual.as_str());
        if !matches {
            warn!(
                "checksum mismatch for file {}: recorded {:?}, stored bytes hash to {}",
                file.id, file.checksum, actual
            );
        }

        self.record_check(conn, file, Some(matches)).await?;
        Ok(matches)
    }

    async fn record_check(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
        outcome: Option<bool>,
    ) -> StorageResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE files SET last_check_at = ?, last_check = ?, updated = ? WHERE id = ?")
            .bind(now)
            .bind(outcome)
            .bind(now)
            .bind(file.id)
            .execute(&mut *conn)
            .await?;

        file.last_check_at = Some(now);
        file.last_check = outcome;
        file.updated = now;
        Ok(())
    }

    /// Open the content of `file` for reading.
    ///
    /// Returns the reader together with the exact byte length.
    pub async fn open(&self, file: &FileInstance) -> StorageResult<(ContentReader, u64)> {
        let uri = readable_uri(file)?;
        let reader = self.backend.open(&uri).await?;
        Ok((reader, file.size.max(0) as u64))
    }

    /// Remove bytes written for a file whose attachment was rejected.
    pub(crate) async fn discard_bytes(&self, uri: &str) {
        if let Err(err) = self.backend.delete(uri).await {
            debug!("failed to discard rejected content at {}: {}", uri, err);
        }
    }

    /// Stream `content` into the backend under `root` for the file id
    /// `file_id`, without touching the database.
    ///
    /// Nothing is left behind in the backend when this fails.
    pub(crate) async fn stage<S>(
        &self,
        file_id: Uuid,
        root: &str,
        content: S,
        size_hint: Option<u64>,
        limit: SizeLimit,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<StagedContent>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let uri = self.backend.make_uri(root, file_id);
        debug!("streaming content for file {} to {}", file_id, uri);
        let stored = self
            .backend
            .save(&uri, content.boxed(), size_hint, limit, progress)
            .await?;
        Ok(StagedContent {
            file_id,
            uri,
            stored,
        })
    }

    async fn write_content<S>(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
        content: S,
        options: WriteOptions<'_>,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let root = match options.default_location {
            Some(root) => root.to_string(),
            None => self.locations.resolve(conn, None).await?.uri,
        };
        let staged = self
            .stage(file.id, &root, content, options.size_hint, options.limit, progress)
            .await?;

        if let Err(err) = self
            .record_content(conn, file, &staged.uri, &staged.stored, options.storage_class)
            .await
        {
            self.discard_bytes(&staged.uri).await;
            return Err(err);
        }
        Ok(())
    }

    /// Persist URI, size and checksum and flip the instance to read-only.
    ///
    /// Guarded on `uri IS NULL` so two writers cannot both attach content.
    async fn record_content(
        &self,
        conn: &mut SqliteConnection,
        file: &mut FileInstance,
        uri: &str,
        stored: &StoredContent,
        storage_class: Option<&str>,
    ) -> StorageResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE files
             SET uri = ?, size = ?, checksum = ?, storage_class = ?,
                 readable = 1, writable = 0, updated = ?
             WHERE id = ? AND uri IS NULL",
        )
        .bind(uri)
        .bind(stored.size)
        .bind(&stored.checksum)
        .bind(storage_class)
        .bind(now)
        .bind(file.id)
        .execute(&mut *conn)
        .await
        .map_err(|err| map_unique(err, format!("URI `{}` is already in use", uri)))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::FileInstanceAlreadySet);
        }

        file.uri = Some(uri.to_string());
        file.size = stored.size;
        file.checksum = Some(stored.checksum.clone());
        file.storage_class = storage_class.map(String::from);
        file.readable = true;
        file.writable = false;
        file.updated = now;
        Ok(())
    }
}

fn readable_uri(file: &FileInstance) -> StorageResult<String> {
    match (&file.uri, file.readable) {
        (Some(uri), true) => Ok(uri.clone()),
        _ => Err(StorageError::FileInstanceUnreadable(file.id)),
    }
}
