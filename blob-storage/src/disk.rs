use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;

use blob_driver::{BlobStore, Digest, Metadata, StorageError, StorageErrorKind};

/// Directory under the root where blobs are staged before being renamed into place.
const STAGING_DIR: &str = ".uploads";

/// Directory under the root holding finished blobs.
const BLOBS_DIR: &str = "blobs";

/// Blob store that keeps each blob as a file under a root directory.
///
/// Blobs live at `<root>/blobs/<algorithm>/<encoded>`, leaving the rest of the
/// root free for other data such as manifests. Writes go to a staging file
/// first and are renamed into place, so readers only ever see complete blobs
/// and no in-process locking is needed.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    root: Utf8PathBuf,
}

impl DiskBlobStore {
    /// Open a store rooted at `root`, creating the directory if it is missing.
    ///
    /// Existing contents are left untouched.
    #[tracing::instrument(skip_all, fields(root = %root.as_ref()))]
    pub async fn open(root: impl AsRef<Utf8Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_owned();

        tokio::fs::create_dir_all(root.join(STAGING_DIR))
            .await
            .map_err(|err| io_error(err, "create storage directory"))?;

        tracing::debug!("opened disk blob store");
        Ok(Self { root })
    }

    /// The directory this store writes to.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn algorithm_dir(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.root.join(BLOBS_DIR);
        path.push(digest.algorithm());
        path
    }

    fn path(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.algorithm_dir(digest);
        path.push(digest.encoded());
        path
    }

    fn staging_path(&self) -> Utf8PathBuf {
        let mut path = self.root.join(STAGING_DIR);
        path.push(uuid::Uuid::new_v4().to_string());
        path
    }

    async fn write_staged(
        &self,
        staging: &Utf8Path,
        data: &[u8],
        target: &Utf8Path,
    ) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(staging, target).await
    }
}

fn io_error(err: std::io::Error, context: &'static str) -> StorageError {
    StorageError::builder("disk", StorageErrorKind::from_io(&err), err)
        .context(context)
        .build()
}

fn digest_io_error(err: std::io::Error, digest: &Digest, context: &'static str) -> StorageError {
    StorageError::builder("disk", StorageErrorKind::from_io(&err), err)
        .digest(digest)
        .context(context)
        .build()
}

#[async_trait::async_trait]
impl BlobStore for DiskBlobStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes, StorageError> {
        let path = self.path(digest);
        if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
            return Err(StorageError::not_found("disk", digest));
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|err| digest_io_error(err, digest, "read blob"))?;
        Ok(data.into())
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<(), StorageError> {
        let target = self.path(digest);

        tokio::fs::create_dir_all(self.algorithm_dir(digest))
            .await
            .map_err(|err| digest_io_error(err, digest, "create algorithm directory"))?;

        let staging = self.staging_path();
        if let Err(err) = self.write_staged(&staging, &data, &target).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                tracing::trace!(%staging, "staging file not removed: {cleanup}");
            }
            return Err(digest_io_error(err, digest, "write blob"));
        }

        tracing::trace!(%digest, size = data.len(), "wrote blob");
        Ok(())
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        let metadata = tokio::fs::metadata(self.path(digest))
            .await
            .map_err(|err| digest_io_error(err, digest, "stat blob"))?;

        // Only regular files are blobs.
        if !metadata.is_file() {
            return Err(StorageError::not_found("disk", digest));
        }

        let created = metadata
            .modified()
            .map_err(|err| digest_io_error(err, digest, "blob modification time"))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, digest: &Digest) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.path(digest))
            .await
            .map_err(|err| digest_io_error(err, digest, "remove blob"))
    }
}
