//! # OCI Container Registry
//!
//! A small registry server following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! meant for local development and tests rather than production traffic.
//!
//! ## Features
//!
//! - Blob push and pull, monolithic or chunked, with cross-repository mounts
//! - Manifest and tag operations
//! - Blobs in memory or in a directory on disk
//! - A server lifecycle with graceful shutdown on cancellation
//!
//! ## Example
//!
//! ```no_run
//! use registry::ServerConfig;
//!
//! # async fn example() -> Result<(), registry::ServerError> {
//! let config = ServerConfig::from_env()?.with_storage_path(Some("./images".into()));
//!
//! let server = registry::start(&config).await?;
//! println!("listening on {}", server.port());
//!
//! server.run(async {
//!     tokio::signal::ctrl_c().await.ok();
//! }).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
mod config;
mod error;
mod manifest;
mod server;
mod storage;
mod upload;

use std::future::Future;

pub use api::RegistryBuilder;
pub use blob_storage::{BlobStorage, DiskBlobStore, MemoryBlobStore, StorageConfig};
pub use config::{
    ConfigError, ConfigFile, DEFAULT_HEADER_READ_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, PORT_ENV,
    ServerConfig, parse_port,
};
pub use error::{RegistryError, RegistryResult};
pub use server::{RunningServer, Server, ServerError, ShutdownSignal};
pub use storage::{ManifestStore, Reference, StoredManifest};
pub use upload::DEFAULT_UPLOAD_IDLE_TIMEOUT;

/// Open storage, bind the listener and start serving.
///
/// Any failure here happens before a connection is accepted. On success the
/// server is listening and [`RunningServer::port`] reports the effective port.
#[tracing::instrument(skip_all, fields(port = config.port))]
pub async fn start(config: &ServerConfig) -> Result<RunningServer, ServerError> {
    if let Some(path) = config.storage.disk_path() {
        tracing::info!("serving on-disk registry at {}", path);
    }

    let blobs = config.storage.build().await?;
    let router = RegistryBuilder::new()
        .blobs(blobs)
        .manifests_dir(config.manifests.clone())
        .build()
        .await?;

    let server = Server::bind(config, router).await?;
    Ok(server.start())
}

/// Serve until `cancel` resolves, then shut down gracefully.
pub async fn serve<C>(config: ServerConfig, cancel: C) -> Result<(), ServerError>
where
    C: Future<Output = ()>,
{
    start(&config).await?.run(cancel).await
}
