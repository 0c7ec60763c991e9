//! Local-disk storage backend.
//!
//! Content for a file id lands at `root/{aa}/{bb}/{rest}/data`, where `aa`
//! and `bb` are the first two hex pairs of the id. Sharding keeps the file
//! count per directory low.

use async_trait::async_trait;
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

use super::{
    ByteStream, ContentReader, ProgressCallback, SizeLimit, StorageBackend, StoredContent,
    md5_checksum,
};
use crate::errors::{StorageError, StorageResult};

/// Number of shard directories between the root and the per-file directory.
const SHARD_DEPTH: usize = 2;

/// Stores content as plain files on the local filesystem.
///
/// Accepts `file://` URIs as well as bare paths.
#[derive(Clone, Debug, Default)]
pub struct LocalFsBackend;

impl LocalFsBackend {
    pub fn new() -> Self {
        Self
    }

    /// Map a storage URI onto a filesystem path.
    fn path_for(uri: &str) -> PathBuf {
        PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
    }

    /// Remove now-empty directories left behind by a deleted file.
    ///
    /// Stops at the first directory that is missing or not empty, and never
    /// climbs above the shard directories.
    async fn prune_empty_dirs(start: &Path) {
        let mut current = start.to_path_buf();
        for _ in 0..=SHARD_DEPTH {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn make_uri(&self, root: &str, file_id: Uuid) -> String {
        let id = file_id.simple().to_string();
        format!(
            "{}/{}/{}/{}/data",
            root.trim_end_matches('/'),
            &id[0..2],
            &id[2..4],
            &id[4..]
        )
    }

    /// Writes bytes incrementally to a temporary sibling, computing MD5 and
    /// size while streaming, then fsyncs and renames into place. The
    /// temporary file is removed on any error.
    async fn save(
        &self,
        uri: &str,
        mut content: ByteStream<'_>,
        size_hint: Option<u64>,
        limit: SizeLimit,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<StoredContent> {
        if let Some(hint) = size_hint {
            limit.check(i64::try_from(hint).unwrap_or(i64::MAX))?;
        }
        let file_path = Self::path_for(uri);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "storage path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut written: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = content.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            if let Err(err) = limit.check((written + chunk.len() as u64) as i64) {
                debug!("rejecting {} after {} bytes: {}", uri, written, err);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
            written += chunk.len() as u64;
            if let Some(callback) = progress.as_mut() {
                callback(written, size_hint);
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        debug!("wrote {} bytes to {}", written, file_path.display());

        Ok(StoredContent {
            size: written as i64,
            checksum: md5_checksum(digest.compute()),
        })
    }

    async fn open(&self, uri: &str) -> StorageResult<ContentReader> {
        let file = File::open(Self::path_for(uri)).await?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, uri: &str) -> StorageResult<()> {
        let file_path = Self::path_for(uri);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            Self::prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn checksum(&self, uri: &str) -> StorageResult<String> {
        let mut file = File::open(Self::path_for(uri)).await?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
        }
        Ok(md5_checksum(digest.compute()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn chunks(parts: &[&'static str]) -> ByteStream<'static> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[test]
    fn uri_is_sharded_under_root() {
        let id = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        let uri = LocalFsBackend.make_uri("file:///srv/data/", id);
        assert_eq!(uri, "file:///srv/data/01/23/456789abcdef0123456789abcdef/data");
    }

    #[tokio::test]
    async fn save_reports_size_checksum_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new();
        let uri = backend.make_uri(dir.path().to_str().unwrap(), Uuid::new_v4());

        let mut seen = Vec::new();
        let mut callback = |done: u64, total: Option<u64>| seen.push((done, total));
        let stored = backend
            .save(
                &uri,
                chunks(&["hel", "lo"]),
                Some(5),
                SizeLimit::default(),
                Some(&mut callback as ProgressCallback<'_>),
            )
            .await
            .unwrap();

        assert_eq!(stored.size, 5);
        assert_eq!(stored.checksum, "md5:5d41402abc4b2a76b9719d911017c592");
        assert_eq!(seen, vec![(3, Some(5)), (5, Some(5))]);
        assert_eq!(backend.checksum(&uri).await.unwrap(), stored.checksum);

        let mut reader = backend.open(&uri).await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"hello");
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new();
        let uri = backend.make_uri(dir.path().to_str().unwrap(), Uuid::new_v4());
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::BrokenPipe, "client went away")),
        ])
        .boxed();

        let err = backend
            .save(&uri, failing, None, SizeLimit::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));

        let parent = LocalFsBackend::path_for(&uri).parent().unwrap().to_path_buf();
        let mut entries = fs::read_dir(&parent).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new();
        let uri = backend.make_uri(dir.path().to_str().unwrap(), Uuid::new_v4());
        backend
            .save(&uri, chunks(&["x"]), None, SizeLimit::default(), None)
            .await
            .unwrap();

        backend.delete(&uri).await.unwrap();
        backend.delete(&uri).await.unwrap();

        assert!(dir.path().exists());
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    /// Endless stream of four-byte chunks that counts how many were pulled.
    fn counted_chunks(pulled: Arc<AtomicUsize>) -> ByteStream<'static> {
        stream::repeat(())
            .map(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"four"))
            })
            .boxed()
    }

    #[tokio::test]
    async fn save_stops_reading_once_over_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new();
        let uri = backend.make_uri(dir.path().to_str().unwrap(), Uuid::new_v4());
        let parent = LocalFsBackend::path_for(&uri).parent().unwrap().to_path_buf();

        let pulled = Arc::new(AtomicUsize::new(0));
        let limit = SizeLimit {
            max_file_size: Some(10),
            ..Default::default()
        };
        let err = backend
            .save(&uri, counted_chunks(pulled.clone()), None, limit, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::FileSizeLimitExceeded { size: 12, limit: 10 }
        ));
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        let mut entries = fs::read_dir(&parent).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        let pulled = Arc::new(AtomicUsize::new(0));
        let limit = SizeLimit {
            quota: Some(10),
            used: 8,
            ..Default::default()
        };
        let err = backend
            .save(&uri, counted_chunks(pulled.clone()), None, limit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 10 }));
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_hint_is_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new();
        let uri = backend.make_uri(dir.path().to_str().unwrap(), Uuid::new_v4());

        let pulled = Arc::new(AtomicUsize::new(0));
        let limit = SizeLimit {
            max_file_size: Some(10),
            ..Default::default()
        };
        let err = backend
            .save(&uri, counted_chunks(pulled.clone()), Some(1000), limit, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::FileSizeLimitExceeded { size: 1000, limit: 10 }
        ));
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert!(!LocalFsBackend::path_for(&uri).parent().unwrap().exists());
    }
}
