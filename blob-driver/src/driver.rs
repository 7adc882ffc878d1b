use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::digest::Digest;
use crate::error::StorageError;

/// Blob metadata, provided generically by each store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the blob in bytes.
    pub size: u64,

    /// When the blob was written.
    pub created: DateTime<Utc>,
}

/// A content-addressed blob store.
///
/// Implementations must accept concurrent `put` calls for distinct digests,
/// and a reader must never observe a partially written blob. Concurrent
/// writes of the same digest resolve as last-writer-wins.
#[async_trait::async_trait]
pub trait BlobStore: fmt::Debug {
    /// The name of the store, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Read a blob. Fails with [`StorageErrorKind::NotFound`](crate::StorageErrorKind::NotFound)
    /// when the digest was never written.
    async fn get(&self, digest: &Digest) -> Result<Bytes, StorageError>;

    /// Store a blob under its digest.
    ///
    /// The store does not verify that `data` hashes to `digest`; that is the
    /// caller's responsibility.
    async fn put(&self, digest: &Digest, data: Bytes) -> Result<(), StorageError>;

    /// Get the metadata for a blob.
    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError>;

    /// Remove a blob. Fails with `NotFound` when the digest is absent.
    async fn delete(&self, digest: &Digest) -> Result<(), StorageError>;

    /// Check whether a blob exists. Only fails on backend errors.
    async fn exists(&self, digest: &Digest) -> Result<bool, StorageError> {
        match self.metadata(digest).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl<S> BlobStore for Arc<S>
where
    S: ?Sized + BlobStore + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes, StorageError> {
        self.deref().get(digest).await
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<(), StorageError> {
        self.deref().put(digest, data).await
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        self.deref().metadata(digest).await
    }

    async fn delete(&self, digest: &Digest) -> Result<(), StorageError> {
        self.deref().delete(digest).await
    }

    async fn exists(&self, digest: &Digest) -> Result<bool, StorageError> {
        self.deref().exists(digest).await
    }
}
