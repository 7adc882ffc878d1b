//! # Blob storage backends
//!
//! Configuration and unification for the blob stores: an in-memory store for
//! throwaway registries, and an on-disk store which survives restarts.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

pub(crate) mod disk;
pub(crate) mod memory;

#[doc(inline)]
pub use disk::DiskBlobStore;

#[doc(inline)]
pub use memory::MemoryBlobStore;

#[doc(inline)]
pub use blob_driver::{BlobStore, Digest, InvalidDigest, Metadata, StorageError, StorageErrorKind};

/// Which blob store to serve from.
///
/// Chosen once at startup: an empty disk path means memory, so the on-disk
/// variant always carries a usable path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep blobs in memory; they are lost when the process exits.
    #[default]
    Memory,

    /// Keep blobs as files under a directory, created if missing.
    Disk {
        /// Root directory of the store.
        path: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Select a backend from an optional storage directory.
    ///
    /// `None` and the empty path both select [`StorageConfig::Memory`].
    pub fn from_path(path: Option<Utf8PathBuf>) -> Self {
        match path {
            Some(path) if !path.as_str().is_empty() => StorageConfig::Disk { path },
            _ => StorageConfig::Memory,
        }
    }

    /// The storage directory, for the on-disk backend.
    pub fn disk_path(&self) -> Option<&Utf8Path> {
        match self {
            StorageConfig::Memory => None,
            StorageConfig::Disk { path } => Some(path),
        }
    }

    /// Construct the configured blob store.
    ///
    /// For the disk backend this creates the storage directory, failing if it
    /// cannot be created.
    #[tracing::instrument]
    pub async fn build(&self) -> Result<BlobStorage, StorageError> {
        let storage: BlobStorage = match self {
            StorageConfig::Memory => MemoryBlobStore::new().into(),
            StorageConfig::Disk { path } => DiskBlobStore::open(path).await?.into(),
        };
        Ok(storage)
    }
}

pub(crate) type ArcStore = Arc<dyn BlobStore + Send + Sync>;

/// A shareable handle to a blob store.
///
/// Cloning is cheap; every clone refers to the same store.
#[derive(Debug, Clone)]
pub struct BlobStorage {
    store: ArcStore,
}

impl<S> From<S> for BlobStorage
where
    S: BlobStore + Send + Sync + 'static,
{
    fn from(value: S) -> Self {
        BlobStorage::new(value)
    }
}

impl BlobStorage {
    /// Wrap a blob store.
    pub fn new<S: BlobStore + Send + Sync + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// The name of the underlying store.
    pub fn name(&self) -> &'static str {
        self.store.name()
    }

    /// Read a blob.
    #[tracing::instrument(skip(self), fields(store = self.store.name(), %digest))]
    pub async fn get(&self, digest: &Digest) -> Result<Bytes, StorageError> {
        self.store.get(digest).await
    }

    /// Store a blob under its digest.
    #[tracing::instrument(skip(self, data), fields(store = self.store.name(), %digest, size = data.len()))]
    pub async fn put(&self, digest: &Digest, data: Bytes) -> Result<(), StorageError> {
        tracing::trace!("storing blob");
        self.store.put(digest, data).await
    }

    /// Check whether a blob exists.
    #[tracing::instrument(skip(self), fields(store = self.store.name(), %digest))]
    pub async fn exists(&self, digest: &Digest) -> Result<bool, StorageError> {
        self.store.exists(digest).await
    }

    /// Get the metadata for a blob.
    #[tracing::instrument(skip(self), fields(store = self.store.name(), %digest))]
    pub async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        self.store.metadata(digest).await
    }

    /// Remove a blob.
    #[tracing::instrument(skip(self), fields(store = self.store.name(), %digest))]
    pub async fn delete(&self, digest: &Digest) -> Result<(), StorageError> {
        self.store.delete(digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_selects_memory() {
        assert_eq!(StorageConfig::from_path(None), StorageConfig::Memory);
        assert_eq!(
            StorageConfig::from_path(Some(Utf8PathBuf::new())),
            StorageConfig::Memory
        );
    }

    #[test]
    fn non_empty_path_selects_disk() {
        let config = StorageConfig::from_path(Some("./images".into()));
        assert_eq!(config.disk_path(), Some(Utf8Path::new("./images")));
    }

    #[tokio::test]
    async fn build_memory() {
        let storage = StorageConfig::Memory.build().await.unwrap();
        assert_eq!(storage.name(), "memory");
    }

    #[tokio::test]
    async fn build_disk_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("images");

        let storage = StorageConfig::Disk { path: path.clone() }
            .build()
            .await
            .unwrap();

        assert_eq!(storage.name(), "disk");
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn clones_share_a_store() {
        let storage = BlobStorage::from(MemoryBlobStore::new());
        let other = storage.clone();
        let digest = Digest::sha256(b"shared");

        storage
            .put(&digest, Bytes::from_static(b"shared"))
            .await
            .unwrap();

        assert!(other.exists(&digest).await.unwrap());
    }
}
