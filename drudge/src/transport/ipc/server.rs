//! Unix socket server.
//!
//! ```text
//! bind:     start lock -> endpoint must not exist -> bind/listen -> engine.start -> unlock
//! run:      accept -> read one request -> dispatch -> write one response -> close
//! teardown: stop lock -> close listener -> remove endpoint -> engine.stop -> unlock
//! ```
//!
//! Connections are served one at a time. Teardown runs however the accept loop
//! ends: signal, client shutdown request, or a fatal accept error.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixSocket, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

use super::handlers::dispatch;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Request, Response};
use crate::config::{ConfigError, ServerConfig};
use crate::engine::{Engine, EngineError};
use crate::lock::{AdvisoryLock, LockError};
use crate::session::SessionFactory;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("endpoint {} already exists; is another server running?", .0.display())]
    EndpointExists(PathBuf),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to bind {}: {source}", .path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("failed to start engine: {0}")]
    Engine(#[from] EngineError),

    #[error("accept failed: {0}")]
    Accept(io::Error),
}

/// Removes the socket file when dropped.
struct Endpoint {
    path: PathBuf,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket")
            }
        }
    }
}

/// A bound server with a running engine.
///
/// Call [`run`](Server::run) to serve and tear down. Dropping an unrun server
/// removes the socket and cancels the engine's worker without waiting for it.
pub struct Server {
    config: ServerConfig,
    listener: UnixListener,
    endpoint: Endpoint,
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Validate `config`, bind the socket and start the engine.
    ///
    /// Fails without touching the existing file if something is already at the
    /// socket path.
    pub async fn bind(
        config: ServerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let engine = Arc::new(Engine::new(config.engine.clone(), factory)?);

        if let Some(parent) = config.socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ServerError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let start_lock = AdvisoryLock::acquire_async(config.start_lock_path()).await?;

        let path = config.socket_path.clone();
        match tokio::fs::symlink_metadata(&path).await {
            Ok(_) => return Err(ServerError::EndpointExists(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(ServerError::Bind { path, source }),
        }

        let bind_error = |source| ServerError::Bind {
            path: path.clone(),
            source,
        };
        let (socket, endpoint) = bind_endpoint(&path).map_err(bind_error)?;
        let listener = socket.listen(config.max_connections).map_err(bind_error)?;

        engine.start()?;
        drop(start_lock);

        info!(
            path = %config.socket_path.display(),
            max_connections = config.max_connections,
            "Listening"
        );
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            endpoint,
            engine,
            shutdown_tx,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Serve until `signal` resolves, a client asks for shutdown, or accept
    /// fails. Always tears down before returning.
    pub async fn run<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            listener,
            endpoint,
            engine,
            shutdown_tx,
        } = self;
        serve_on(listener, config, endpoint, engine, shutdown_tx, signal).await
    }
}

/// Source of client connections.
trait Incoming {
    async fn next_connection(&self) -> io::Result<UnixStream>;
}

impl Incoming for UnixListener {
    async fn next_connection(&self) -> io::Result<UnixStream> {
        self.accept().await.map(|(stream, _)| stream)
    }
}

async fn serve_on<L, F>(
    listener: L,
    config: ServerConfig,
    endpoint: Endpoint,
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
    signal: F,
) -> Result<(), ServerError>
where
    L: Incoming,
    F: Future<Output = ()>,
{
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::pin!(signal);

    let result = loop {
        tokio::select! {
            _ = &mut signal => break Ok(()),
            _ = client_shutdown(&mut shutdown_rx) => break Ok(()),
            accepted = listener.next_connection() => match accepted {
                Ok(stream) => {
                    handle_connection(stream, &engine, &shutdown_tx, &config).await;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    tracing::debug!(error = %e, "Connection aborted before accept");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    break Err(ServerError::Accept(e));
                }
            },
        }
    };

    teardown(&config, listener, endpoint, &engine).await;
    result
}

/// Bind `path`; the returned guard removes the file even if `listen` fails.
fn bind_endpoint(path: &Path) -> io::Result<(UnixSocket, Endpoint)> {
    let socket = UnixSocket::new_stream()?;
    socket.bind(path)?;
    Ok((
        socket,
        Endpoint {
            path: path.to_path_buf(),
        },
    ))
}

async fn client_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    engine: &Engine,
    shutdown_tx: &watch::Sender<bool>,
    config: &ServerConfig,
) {
    let served = tokio::time::timeout(
        config.connection_timeout,
        serve_connection(stream, engine, shutdown_tx),
    )
    .await;
    match served {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Dropped connection"),
        Err(_) => tracing::warn!(
            timeout_secs = config.connection_timeout.as_secs(),
            "Connection timed out"
        ),
    }
}

async fn serve_connection(
    stream: UnixStream,
    engine: &Engine,
    shutdown_tx: &watch::Sender<bool>,
) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<Request>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<Response>::new());

    let request = match reader.next().await {
        Some(request) => request?,
        None => {
            tracing::debug!("Client closed without sending a request");
            return Ok(());
        }
    };

    let response = dispatch(engine, request, shutdown_tx);
    writer.send(response).await
}

async fn teardown<L>(config: &ServerConfig, listener: L, endpoint: Endpoint, engine: &Engine) {
    info!("Shutting down");
    let stop_lock = match AdvisoryLock::acquire_async(config.stop_lock_path()).await {
        Ok(lock) => Some(lock),
        Err(e) => {
            tracing::error!(error = %e, "Failed to take stop lock, tearing down anyway");
            None
        }
    };

    drop(listener);
    drop(endpoint);
    let discarded = engine.stop().await;
    drop(stop_lock);
    info!(discarded, "Server shutdown complete");
}

/// Resolve on SIGINT or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires; the other
/// one still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Bind and serve until SIGINT, SIGTERM or a client shutdown request.
pub async fn serve(
    config: ServerConfig,
    factory: Arc<dyn SessionFactory>,
) -> Result<(), ServerError> {
    let server = Server::bind(config, factory).await?;
    server.run(shutdown_signal()).await
}
