//! Server configuration
//!
//! Configuration is resolved once at startup, in increasing priority: the
//! defaults, an optional TOML file, the `PORT` environment variable, then
//! command line flags. Nothing in the serving path reads the environment.

use std::num::ParseIntError;
use std::time::Duration;

use blob_storage::StorageConfig;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// Environment variable holding the requested listen port.
pub const PORT_ENV: &str = "PORT";

/// How long in-flight requests get to finish once shutdown starts.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// How long a client may take to send its request headers.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors resolving the server configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested port is not a valid TCP port
    #[error("invalid port {value:?}")]
    InvalidPort {
        /// The rejected value
        value: String,
        /// Why it was rejected
        #[source]
        source: ParseIntError,
    },

    /// The configuration file could not be read
    #[error("reading config file {path}")]
    Read {
        /// Path to the configuration file
        path: Utf8PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid
    #[error("parsing config file {path}")]
    Parse {
        /// Path to the configuration file
        path: Utf8PathBuf,
        /// Underlying parse error
        #[source]
        source: toml_edit::de::Error,
    },
}

/// Resolve a requested port from an optional string value.
///
/// Missing and empty values mean port 0, letting the OS choose.
pub fn parse_port(value: Option<&str>) -> Result<u16, ConfigError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0),
        Some(value) => value.parse().map_err(|source| ConfigError::InvalidPort {
            value: value.to_owned(),
            source,
        }),
    }
}

/// Configuration for one serving session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Port to listen on; 0 lets the OS assign one.
    pub port: u16,

    /// Which blob store to use.
    pub storage: StorageConfig,

    /// Where to persist manifests, if anywhere.
    pub manifests: Option<Utf8PathBuf>,

    /// Grace period for in-flight requests during shutdown.
    pub shutdown_grace: Duration,

    /// Connections which do not finish sending headers in time are closed.
    pub header_read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            storage: StorageConfig::Memory,
            manifests: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// The default configuration, with the port taken from `PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_port(std::env::var(PORT_ENV).ok().as_deref())
    }

    /// Apply the value of the `PORT` variable, if it was set and non-empty.
    pub fn with_env_port(mut self, value: Option<&str>) -> Result<Self, ConfigError> {
        if value.is_some_and(|v| !v.trim().is_empty()) {
            self.port = parse_port(value)?;
        }
        Ok(self)
    }

    /// Set the port to listen on.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Select the blob store from an optional directory.
    ///
    /// A non-empty directory selects the on-disk store and also persists
    /// manifests there; otherwise everything stays in memory.
    pub fn with_storage_path(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.storage = StorageConfig::from_path(path);
        self.manifests = self.storage.disk_path().map(Utf8Path::to_owned);
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set how long clients get to send their request headers.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }
}

/// Contents of a TOML configuration file.
///
/// ```toml
/// port = 5000
/// blobs-to-disk = "/var/lib/registry"
/// shutdown-grace-secs = 10
/// header-read-timeout-secs = 5
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    /// Port to listen on.
    pub port: Option<u16>,

    /// Directory for the on-disk blob store.
    pub blobs_to_disk: Option<Utf8PathBuf>,

    /// Directory for manifests, when different from the blob directory.
    pub manifests: Option<Utf8PathBuf>,

    /// Shutdown grace period, in seconds.
    pub shutdown_grace_secs: Option<u64>,

    /// Request header read timeout, in seconds.
    pub header_read_timeout_secs: Option<u64>,
}

impl ConfigFile {
    /// Parse configuration from TOML text.
    pub fn parse(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        toml_edit::de::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Read and parse a configuration file.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?;
        Self::parse(path, &contents)
    }
}

impl From<ConfigFile> for ServerConfig {
    fn from(file: ConfigFile) -> Self {
        let mut config = ServerConfig::default().with_storage_path(file.blobs_to_disk);
        if let Some(port) = file.port {
            config.port = port;
        }
        if file.manifests.is_some() {
            config.manifests = file.manifests;
        }
        if let Some(secs) = file.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = file.header_read_timeout_secs {
            config.header_read_timeout = Duration::from_secs(secs);
        }
        config
    }
}
