//! Command line entry point for the registry server.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::Context;
use registry::{ConfigFile, PORT_ENV, ServerConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "registry-server", about = "A small OCI container registry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a container image registry.
    ///
    /// The listen port comes from `--port`, then the PORT environment
    /// variable, then the config file. When none is set the OS picks one.
    Serve {
        /// Store blobs in this directory instead of memory
        #[arg(long, hide = true)]
        blobs_to_disk: Option<Utf8PathBuf>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<Utf8PathBuf>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_error::ErrorLayer::default())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            blobs_to_disk,
            port,
            config,
        } => {
            let config = resolve_config(config, port, blobs_to_disk).await?;
            registry::serve(config, shutdown_signal())
                .await
                .wrap_err("registry server")?;
        }
    }

    Ok(())
}

async fn resolve_config(
    path: Option<Utf8PathBuf>,
    port: Option<u16>,
    blobs_to_disk: Option<Utf8PathBuf>,
) -> eyre::Result<ServerConfig> {
    let file = match path {
        Some(path) => ConfigFile::load(&path).await?,
        None => ConfigFile::default(),
    };

    let mut config = ServerConfig::from(file)
        .with_env_port(std::env::var(PORT_ENV).ok().as_deref())?;

    if let Some(port) = port {
        config = config.with_port(port);
    }
    if blobs_to_disk.is_some() {
        config = config.with_storage_path(blobs_to_disk);
    }

    Ok(config)
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
