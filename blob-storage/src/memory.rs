use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use blob_driver::{BlobStore, Digest, Metadata, StorageError};

#[derive(Debug, Clone)]
struct MemoryBlob {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryBlob {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryBlob> for Metadata {
    fn from(value: &MemoryBlob) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Blob store that keeps every blob in process memory.
///
/// Contents are lost when the store is dropped, and nothing is ever evicted.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Digest, MemoryBlob>>,
}

impl MemoryBlobStore {
    /// Create an empty `MemoryBlobStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether the store holds no blobs.
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes, StorageError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(digest)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| StorageError::not_found(self.name(), digest))
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(digest.clone(), data.into());
        Ok(())
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(digest)
            .map(Metadata::from)
            .ok_or_else(|| StorageError::not_found(self.name(), digest))
    }

    async fn delete(&self, digest: &Digest) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(self.name(), digest))
    }
}
