//! API server builder and router

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use blob_storage::{BlobStorage, MemoryBlobStore};
use camino::Utf8PathBuf;
use serde_json::json;

use crate::error::{RegistryError, RegistryResult};
use crate::storage::ManifestStore;
use crate::upload::{DEFAULT_UPLOAD_IDLE_TIMEOUT, UploadSessions};

/// Shared state for every registry handler
#[derive(Debug, Clone)]
pub(crate) struct RegistryState {
    pub(crate) blobs: BlobStorage,
    pub(crate) manifests: Arc<ManifestStore>,
    pub(crate) uploads: Arc<UploadSessions>,
}

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    blobs: Option<BlobStorage>,
    manifests: Option<ManifestStore>,
    manifests_dir: Option<Utf8PathBuf>,
    upload_idle_timeout: Duration,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            blobs: None,
            manifests: None,
            manifests_dir: None,
            upload_idle_timeout: DEFAULT_UPLOAD_IDLE_TIMEOUT,
        }
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop chunked uploads which see no activity for this long.
    pub fn upload_idle_timeout(mut self, timeout: Duration) -> Self {
        self.upload_idle_timeout = timeout;
        self
    }

    /// Set the blob store. Defaults to an in-memory store.
    pub fn blobs(mut self, blobs: BlobStorage) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Persist manifests and tags under this directory.
    ///
    /// `None` keeps manifests in memory only.
    pub fn manifests_dir(mut self, dir: Option<Utf8PathBuf>) -> Self {
        self.manifests_dir = dir;
        self
    }

    /// Use an already opened manifest store, ignoring any manifest directory.
    pub fn manifests(mut self, manifests: ManifestStore) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Build the registry service
    ///
    /// Opens the manifest directory, if one was set, and returns a Router
    /// that can be served with any tower-compatible server. Request bodies
    /// are not size limited, since a single chunk may carry a whole layer.
    pub async fn build(self) -> RegistryResult<Router> {
        let blobs = self
            .blobs
            .unwrap_or_else(|| MemoryBlobStore::new().into());

        let manifests = match self.manifests {
            Some(manifests) => manifests,
            None => ManifestStore::open(self.manifests_dir).await?,
        };

        let state = RegistryState {
            blobs,
            manifests: Arc::new(manifests),
            uploads: Arc::new(UploadSessions::new(self.upload_idle_timeout)),
        };

        Ok(Router::new()
            .route("/v2/", get(api_version_check))
            .merge(crate::blob::router())
            .merge(crate::manifest::router())
            .layer(DefaultBodyLimit::disable())
            .with_state(state))
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

/// Validate a repository name component
///
/// Lowercase alphanumerics, separated by single `.`, `_` or `-` runs.
pub(crate) fn validate_repository(name: &str) -> RegistryResult<()> {
    let bytes = name.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    let valid = !bytes.is_empty()
        && bytes.len() <= 255
        && bytes.first().is_some_and(alnum)
        && bytes.last().is_some_and(alnum)
        && bytes
            .iter()
            .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
        && !name.contains("..");

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_string()))
    }
}
