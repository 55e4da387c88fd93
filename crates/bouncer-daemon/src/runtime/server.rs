//! Protocol listeners served inside a worker.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Errors while serving a listener.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to bind {listener}: {source}")]
    Bind {
        listener: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept on {listener}: {source}")]
    Accept {
        listener: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a bounded graceful shutdown.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("graceful shutdown deadline exceeded with {open} connection(s) still open")]
    DeadlineExceeded { open: usize },

    #[error("failed to shut down server: {0}")]
    Failed(String),
}

/// Server a worker runs for the reverse proxy.
///
/// `serve_*` return `Ok` once `cancel` fires, or at once when that listener
/// is not configured. `shutdown` stops admitting connections and waits for
/// open ones up to `grace`, enforcing the deadline itself.
pub trait ProtocolServer: Send + Sync + 'static {
    fn serve_tcp(&self, cancel: CancellationToken) -> impl Future<Output = Result<(), ServeError>> + Send;

    fn serve_unix(&self, cancel: CancellationToken) -> impl Future<Output = Result<(), ServeError>> + Send;

    fn shutdown(&self, grace: Duration) -> impl Future<Output = Result<(), ShutdownError>> + Send;
}

/// Per-connection protocol logic.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle one connection. `cancel` fires when the grace period has run
    /// out and the connection must be dropped.
    fn handle<S>(&self, stream: S, cancel: CancellationToken) -> impl Future<Output = ()> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// Keeps a connection open, discarding input, until the peer closes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainHandler;

impl ConnectionHandler for DrainHandler {
    async fn handle<S>(&self, mut stream: S, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                read = stream.read(&mut buf) => match read {
                    Ok(0) => return,
                    Ok(n) => debug!(bytes = n, "Discarded protocol bytes"),
                    Err(e) => {
                        debug!(error = %e, "Protocol connection error");
                        return;
                    }
                }
            }
        }
    }
}

/// Protocol server bound to a TCP address, a Unix socket, or both.
///
/// Listeners are bound by [`bind`](Self::bind), before serving starts, so a
/// bad address fails the worker immediately.
pub struct SpoaServer<H = DrainHandler> {
    tcp: Mutex<Option<TcpListener>>,
    unix: Mutex<Option<UnixListener>>,
    tcp_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    handler: Arc<H>,
    connections: TaskTracker,
    /// Fired when the grace period expires.
    force_close: CancellationToken,
}

impl<H: ConnectionHandler> SpoaServer<H> {
    pub async fn bind(
        tcp: Option<SocketAddr>,
        unix: Option<&Path>,
        handler: H,
    ) -> Result<Self, ServeError> {
        let tcp_listener = match tcp {
            Some(addr) => Some(TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
                listener: addr.to_string(),
                source,
            })?),
            None => None,
        };
        let tcp_addr = match &tcp_listener {
            Some(listener) => Some(listener.local_addr().map_err(|source| ServeError::Bind {
                listener: "tcp".into(),
                source,
            })?),
            None => None,
        };

        let unix_listener = match unix {
            Some(path) => Some(bind_unix(path).map_err(|source| ServeError::Bind {
                listener: path.display().to_string(),
                source,
            })?),
            None => None,
        };

        Ok(Self {
            tcp: Mutex::new(tcp_listener),
            unix: Mutex::new(unix_listener),
            tcp_addr,
            unix_path: unix.map(Path::to_path_buf),
            handler: Arc::new(handler),
            connections: TaskTracker::new(),
            force_close: CancellationToken::new(),
        })
    }

    /// Bound TCP address (resolves port 0).
    pub const fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Connections currently being handled.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    fn admit<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let cancel = self.force_close.clone();
        self.connections
            .spawn(async move { handler.handle(stream, cancel).await });
    }
}

fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

impl<H: ConnectionHandler> ProtocolServer for SpoaServer<H> {
    async fn serve_tcp(&self, cancel: CancellationToken) -> Result<(), ServeError> {
        let taken = self.tcp.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(listener) = taken else {
            return Ok(());
        };
        let name = self.tcp_addr.map_or_else(|| "tcp".into(), |a| a.to_string());
        info!(addr = %name, "Serving protocol on TCP");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(|source| ServeError::Accept {
                        listener: name.clone(),
                        source,
                    })?;
                    debug!(%peer, "Accepted TCP connection");
                    self.admit(stream);
                }
            }
        }
        debug!(addr = %name, "TCP listener closed");
        Ok(())
    }

    async fn serve_unix(&self, cancel: CancellationToken) -> Result<(), ServeError> {
        let taken = self.unix.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(listener) = taken else {
            return Ok(());
        };
        let name = self
            .unix_path
            .as_ref()
            .map_or_else(|| "unix".into(), |p| p.display().to_string());
        info!(path = %name, "Serving protocol on Unix socket");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(|source| ServeError::Accept {
                        listener: name.clone(),
                        source,
                    })?;
                    debug!(path = %name, "Accepted Unix connection");
                    self.admit(stream);
                }
            }
        }
        debug!(path = %name, "Unix listener closed");
        Ok(())
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        // Listeners not taken by a serve loop are dropped here.
        drop(self.tcp.lock().unwrap_or_else(PoisonError::into_inner).take());
        drop(self.unix.lock().unwrap_or_else(PoisonError::into_inner).take());

        self.connections.close();
        let drained = tokio::time::timeout(grace, self.connections.wait()).await;

        let removed = match &self.unix_path {
            Some(path) => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ShutdownError::Failed(format!(
                    "removing {}: {e}",
                    path.display()
                ))),
            },
            None => Ok(()),
        };

        if drained.is_err() {
            let open = self.connections.len();
            warn!(open, grace_secs = grace.as_secs_f64(), "Grace period expired, closing connections");
            self.force_close.cancel();
            return Err(ShutdownError::DeadlineExceeded { open });
        }
        removed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpStream, UnixStream};

    use super::*;

    #[tokio::test]
    async fn shutdown_without_connections_is_immediate() {
        let server = SpoaServer::bind(Some("127.0.0.1:0".parse().unwrap()), None, DrainHandler)
            .await
            .unwrap();
        assert!(server.tcp_addr().is_some_and(|a| a.port() != 0));
        server.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn open_connection_exceeds_deadline() {
        let server = Arc::new(
            SpoaServer::bind(Some("127.0.0.1:0".parse().unwrap()), None, DrainHandler)
                .await
                .unwrap(),
        );
        let addr = server.tcp_addr().unwrap();
        let cancel = CancellationToken::new();
        let serving = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve_tcp(cancel).await })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        while server.open_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        serving.await.unwrap().unwrap();
        let err = server
            .shutdown(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ShutdownError::DeadlineExceeded { open: 1 }));
    }

    #[tokio::test]
    async fn closed_connection_drains_in_time() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("spoa").join("w1.sock");
        let server = Arc::new(SpoaServer::bind(None, Some(&path), DrainHandler).await.unwrap());
        let cancel = CancellationToken::new();
        let serving = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve_unix(cancel).await })
        };

        let client = UnixStream::connect(&path).await.unwrap();
        while server.open_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(client);

        cancel.cancel();
        serving.await.unwrap().unwrap();
        server.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unconfigured_listener_returns_at_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("w.sock");
        let server = SpoaServer::bind(None, Some(&path), DrainHandler).await.unwrap();
        server.serve_tcp(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_names_the_listener() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = SpoaServer::bind(Some(addr), None, DrainHandler)
            .await
            .err()
            .expect("address in use");
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
