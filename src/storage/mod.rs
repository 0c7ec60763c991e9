//! Byte storage behind file instances.
//!
//! The metadata engine never touches bytes itself; it asks a
//! [`StorageBackend`] to write, read, delete and re-hash content addressed by
//! URI. URIs are minted under a [`Location`](crate::models::location::Location)
//! root by [`StorageBackend::make_uri`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, pin::Pin};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::errors::{StorageError, StorageResult};

pub mod local;

pub use local::LocalFsBackend;

/// Content being written, chunk by chunk.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Reader over stored content.
pub type ContentReader = Pin<Box<dyn AsyncRead + Send>>;

/// Invoked after every written chunk with `(bytes_written, total_size)`.
///
/// `total_size` is the expected size when the caller knows it. Calls happen
/// synchronously on the writing task and are not evenly spaced.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(u64, Option<u64>) + Send);

/// Outcome of a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub size: i64,
    pub checksum: String,
}

/// Byte budget a single write has to fit in.
///
/// The default value places no limit on the write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeLimit {
    /// Largest accepted content, in bytes.
    pub max_file_size: Option<i64>,
    /// Total bytes the owning bucket may hold.
    pub quota: Option<i64>,
    /// Bytes already counted against `quota`.
    pub used: i64,
}

impl SizeLimit {
    /// Fail when content of `size` bytes would break the limit.
    pub fn check(&self, size: i64) -> StorageResult<()> {
        if let Some(limit) = self.max_file_size {
            if size > limit {
                return Err(StorageError::FileSizeLimitExceeded { size, limit });
            }
        }
        if let Some(quota) = self.quota {
            if self.used.saturating_add(size) > quota {
                return Err(StorageError::QuotaExceeded { quota });
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Mint the URI new content for `file_id` is written to under `root`.
    fn make_uri(&self, root: &str, file_id: Uuid) -> String;

    /// Stream `content` to `uri`, returning the bytes written and their checksum.
    ///
    /// Stops reading and removes the partial write as soon as the content
    /// outgrows `limit`. A `size_hint` already over the limit fails before
    /// anything is read.
    async fn save(
        &self,
        uri: &str,
        content: ByteStream<'_>,
        size_hint: Option<u64>,
        limit: SizeLimit,
        progress: Option<ProgressCallback<'_>>,
    ) -> StorageResult<StoredContent>;

    /// Open stored content for reading.
    async fn open(&self, uri: &str) -> StorageResult<ContentReader>;

    /// Remove stored content. Missing content is not an error.
    async fn delete(&self, uri: &str) -> StorageResult<()>;

    /// Recompute the checksum of the bytes stored at `uri`.
    async fn checksum(&self, uri: &str) -> StorageResult<String>;
}

/// Format an MD5 digest the way checksums are recorded.
pub fn md5_checksum(digest: md5::Digest) -> String {
    format!("md5:{:x}", digest)
}
