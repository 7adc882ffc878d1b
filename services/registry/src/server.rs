//! Server lifecycle
//!
//! A serving session moves through `Created → Bound → Serving →
//! ShuttingDown → Closed`. The first two states are [`Server`], which owns
//! the bound listener; [`Server::start`] hands the listener to the accept
//! loop and returns a [`RunningServer`], and [`RunningServer::run`] consumes
//! that to drive shutdown, so the listener is closed exactly once.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use blob_storage::StorageError;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tower_http::trace::TraceLayer;

use crate::config::{ConfigError, ServerConfig};
use crate::error::RegistryError;

/// Errors from a serving session
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration could not be resolved
    #[error("resolving configuration")]
    Config(#[from] ConfigError),

    /// The blob store could not be opened
    #[error("opening blob storage")]
    Storage(#[from] StorageError),

    /// The registry handler could not be built
    #[error("opening manifest storage")]
    Registry(#[from] RegistryError),

    /// The listener could not be bound
    #[error("binding listener on {addr}")]
    Bind {
        /// The requested address
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// The accept loop failed for a reason other than shutdown
    #[error("server failed")]
    Serve(#[source] io::Error),

    /// The accept loop task panicked
    #[error("server task panicked")]
    Panicked(#[source] JoinError),

    /// In-flight requests did not finish within the grace period
    #[error("in-flight requests did not finish within {grace:?}")]
    ShutdownTimeout {
        /// The grace period which elapsed
        grace: Duration,
    },
}

impl ServerError {
    /// Whether this error happened before anything was served.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            ServerError::Config(_)
                | ServerError::Storage(_)
                | ServerError::Registry(_)
                | ServerError::Bind { .. }
        )
    }
}

/// A server with a bound listener, not yet accepting connections.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    grace: Duration,
    header_read_timeout: Duration,
}

impl Server {
    /// Bind a listener on all interfaces at the configured port.
    ///
    /// The effective port is known (and logged) as soon as this returns,
    /// which matters when port 0 asked the OS to choose.
    #[tracing::instrument(skip_all, fields(port = config.port))]
    pub async fn bind(config: &ServerConfig, router: Router) -> Result<Self, ServerError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let bind_error = |source| ServerError::Bind { addr, source };

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::info!("serving on port {}", local_addr.port());

        Ok(Self {
            listener,
            local_addr,
            router,
            grace: config.shutdown_grace,
            header_read_timeout: config.header_read_timeout,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections in a background task.
    pub fn start(self) -> RunningServer {
        let Server {
            listener,
            local_addr,
            router,
            grace,
            header_read_timeout,
        } = self;

        let app = router.layer(TraceLayer::new_for_http());
        RunningServer::spawn(local_addr, grace, move |shutdown| {
            accept_loop(listener, app, header_read_timeout, shutdown)
        })
    }
}

/// Accept connections until `shutdown` resolves, then wait for open
/// connections to finish their in-flight requests.
async fn accept_loop(
    listener: TcpListener,
    app: Router,
    header_read_timeout: Duration,
    mut shutdown: ShutdownSignal,
) -> io::Result<()> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);

    let graceful = GracefulShutdown::new();

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_connection_error(&err) => {
                    tracing::trace!("connection dropped before accept: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            },
            () = &mut shutdown => break,
        };

        let service = TowerToHyperService::new(app.clone());
        let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
        let conn = graceful.watch(conn.into_owned());

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(%remote, "connection closed: {err}");
            }
        });
    }

    drop(listener);
    graceful.shutdown().await;
    Ok(())
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Resolves once the server has been asked to shut down.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped trigger also means nobody is left to keep us running.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

/// A server whose accept loop is running.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    grace: Duration,
    trigger: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

impl RunningServer {
    /// Spawn an accept loop which stops when its [`ShutdownSignal`] resolves.
    ///
    /// The task's result is the loop's terminal outcome: `Ok(())` for a
    /// deliberate shutdown, anything else is an error.
    pub(crate) fn spawn<F, Fut>(local_addr: SocketAddr, grace: Duration, serve: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        let (trigger, rx) = oneshot::channel();
        let task = tokio::spawn(serve(ShutdownSignal { rx }));
        tracing::debug!(%local_addr, "accept loop started");

        Self {
            local_addr,
            grace,
            trigger,
            task,
        }
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port the server is listening on.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Serve until `cancel` resolves, then shut down gracefully.
    ///
    /// In-flight requests get the configured grace period to finish. The
    /// accept loop's outcome is always collected, so a failure that races
    /// with the shutdown request is still reported. If the loop stops on its
    /// own before cancellation, its outcome is returned immediately.
    #[tracing::instrument(skip_all, fields(addr = %self.local_addr))]
    pub async fn run<C>(self, cancel: C) -> Result<(), ServerError>
    where
        C: Future<Output = ()>,
    {
        let RunningServer {
            grace,
            trigger,
            mut task,
            ..
        } = self;

        tokio::select! {
            () = cancel => {}
            outcome = &mut task => {
                tracing::warn!("server stopped before shutdown was requested");
                return outcome_to_result(outcome);
            }
        }

        tracing::info!("shutting down...");
        if trigger.send(()).is_err() {
            tracing::debug!("accept loop already stopped");
        }

        match tokio::time::timeout(grace, &mut task).await {
            Ok(outcome) => {
                let result = outcome_to_result(outcome);
                if result.is_ok() {
                    tracing::info!("server closed");
                }
                result
            }
            Err(_) => {
                tracing::warn!(?grace, "grace period elapsed, closing remaining connections");
                task.abort();
                Err(ServerError::ShutdownTimeout { grace })
            }
        }
    }
}

fn outcome_to_result(outcome: Result<io::Result<()>, JoinError>) -> Result<(), ServerError> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ServerError::Serve(err)),
        Err(err) => Err(ServerError::Panicked(err)),
    }
}
