//! Rendezvous socket allocation and accept loops.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use nix::unistd::Gid;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mode of every rendezvous socket: owner and worker group may connect.
const SOCKET_MODE: u32 = 0o660;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors from rendezvous socket operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid worker name for a rendezvous socket: '{0}'")]
    InvalidName(String),

    #[error("Rendezvous socket already allocated for worker '{0}'")]
    AlreadyAllocated(String),

    #[error("Control socket server is closed")]
    Closed,

    #[error("Failed to set ownership of {path}: {source}")]
    Ownership {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A worker's connection to its rendezvous socket.
#[derive(Debug)]
pub struct SocketConn {
    /// Name of the worker the socket was allocated for.
    pub worker: String,
    pub stream: UnixStream,
}

/// Allocates rendezvous sockets on behalf of the worker manager.
pub trait RendezvousAllocator: Send + Sync + 'static {
    /// Create a socket scoped to `worker` that members of `gid` can reach,
    /// returning its path.
    fn allocate(&self, worker: &str, gid: Gid) -> Result<PathBuf, ControlError>;
}

/// Owns the rendezvous socket namespace under one directory.
///
/// Each allocation binds `<dir>/<worker>.sock`, hands it to the worker's
/// group, and spawns an accept loop that forwards connections on the shared
/// channel. [`close`](Self::close) stops the loops and unlinks every socket;
/// it runs at most once and is also invoked on drop.
pub struct ControlSocketServer {
    dir: PathBuf,
    conns: mpsc::Sender<SocketConn>,
    cancel: CancellationToken,
    sockets: Mutex<HashMap<String, PathBuf>>,
    closed: AtomicBool,
}

impl ControlSocketServer {
    /// Create the server, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, conns: mpsc::Sender<SocketConn>) -> Result<Self, ControlError> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        }
        info!(dir = %dir.display(), "Control socket server ready");
        Ok(Self {
            dir,
            conns,
            cancel: CancellationToken::new(),
            sockets: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of sockets currently allocated.
    pub fn allocated(&self) -> usize {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every accept loop and remove every socket file.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let sockets = std::mem::take(
            &mut *self
                .sockets
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (worker, path) in sockets {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(worker = %worker, path = %path.display(), "Removed rendezvous socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(worker = %worker, path = %path.display(), error = %e, "Failed to remove rendezvous socket"),
            }
        }
        info!(dir = %self.dir.display(), "Control socket server closed");
    }

    fn bind(&self, worker: &str, gid: Gid) -> Result<(UnixListener, PathBuf), ControlError> {
        let path = self.dir.join(format!("{worker}.sock"));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        if let Err(e) = restrict(&path, gid) {
            if let Err(rm) = std::fs::remove_file(&path) {
                warn!(worker, path = %path.display(), error = %rm, "Failed to remove rendezvous socket");
            }
            return Err(e);
        }
        Ok((listener, path))
    }
}

/// Hand the socket to the worker's group and make it group-accessible only.
fn restrict(path: &Path, gid: Gid) -> Result<(), ControlError> {
    nix::unistd::chown(path, None, Some(gid)).map_err(|source| ControlError::Ownership {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(())
}

impl RendezvousAllocator for ControlSocketServer {
    fn allocate(&self, worker: &str, gid: Gid) -> Result<PathBuf, ControlError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ControlError::Closed);
        }
        if !is_valid_name(worker) {
            return Err(ControlError::InvalidName(worker.to_string()));
        }

        let mut sockets = self
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sockets.contains_key(worker) {
            return Err(ControlError::AlreadyAllocated(worker.to_string()));
        }

        let (listener, path) = self.bind(worker, gid)?;
        sockets.insert(worker.to_string(), path.clone());
        drop(sockets);

        info!(worker, path = %path.display(), gid = gid.as_raw(), "Allocated rendezvous socket");
        tokio::spawn(accept_loop(
            listener,
            worker.to_string(),
            self.conns.clone(),
            self.cancel.child_token(),
        ));
        Ok(path)
    }
}

impl Drop for ControlSocketServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\0'])
}

async fn accept_loop(
    listener: UnixListener,
    worker: String,
    conns: mpsc::Sender<SocketConn>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!(
                        worker = %worker,
                        peer_pid = ?stream.peer_cred().ok().and_then(|cred| cred.pid()),
                        "Worker connected to rendezvous socket"
                    );
                    let conn = SocketConn { worker: worker.clone(), stream };
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = conns.send(conn) => {
                            if sent.is_err() {
                                debug!(worker = %worker, "Connection channel closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(worker = %worker, error = %e, "Accept failed on rendezvous socket");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    debug!(worker = %worker, "Rendezvous accept loop finished");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use nix::unistd::{getgid, getgroups, getuid};

    use super::*;

    fn server(dir: &Path) -> (ControlSocketServer, mpsc::Receiver<SocketConn>) {
        let (tx, rx) = mpsc::channel(4);
        (ControlSocketServer::new(dir.join("sockets"), tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn allocate_binds_group_owned_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let (server, _rx) = server(tmp.path());

        let path = server.allocate("w1", getgid()).unwrap();
        assert_eq!(path, server.dir().join("w1.sock"));

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.gid(), getgid().as_raw());
        assert_eq!(meta.mode() & 0o777, SOCKET_MODE);
        assert_eq!(server.allocated(), 1);
    }

    #[tokio::test]
    async fn allocate_rejects_duplicates_and_bad_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (server, _rx) = server(tmp.path());

        server.allocate("w1", getgid()).unwrap();
        assert!(matches!(
            server.allocate("w1", getgid()),
            Err(ControlError::AlreadyAllocated(name)) if name == "w1"
        ));
        for bad in ["", ".", "..", "../escape", "a/b"] {
            assert!(matches!(
                server.allocate(bad, getgid()),
                Err(ControlError::InvalidName(_))
            ));
        }
        assert_eq!(server.allocated(), 1);
    }

    #[tokio::test]
    async fn connections_are_tagged_with_worker_name() {
        let tmp = tempfile::tempdir().unwrap();
        let (server, mut rx) = server(tmp.path());

        let w1 = server.allocate("w1", getgid()).unwrap();
        let w2 = server.allocate("w2", getgid()).unwrap();
        assert_ne!(w1, w2);

        let _c2 = UnixStream::connect(&w2).await.unwrap();
        let conn = rx.recv().await.expect("connection");
        assert_eq!(conn.worker, "w2");

        let _c1 = UnixStream::connect(&w1).await.unwrap();
        let conn = rx.recv().await.expect("connection");
        assert_eq!(conn.worker, "w1");
    }

    #[tokio::test]
    async fn close_removes_sockets_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (server, _rx) = server(tmp.path());

        let path = server.allocate("w1", getgid()).unwrap();
        server.close();
        assert!(!path.exists());
        assert_eq!(server.allocated(), 0);

        // Second close is a no-op, later allocations are refused.
        server.close();
        assert!(matches!(
            server.allocate("w2", getgid()),
            Err(ControlError::Closed)
        ));
    }

    #[tokio::test]
    async fn failed_chown_leaves_no_socket_behind() {
        // Root may chown to any group.
        if getuid().is_root() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (server, _rx) = server(tmp.path());

        let groups = getgroups().unwrap();
        let foreign = (1..u32::from(u16::MAX))
            .map(Gid::from_raw)
            .find(|g| *g != getgid() && !groups.contains(g))
            .unwrap();

        assert!(matches!(
            server.allocate("w1", foreign),
            Err(ControlError::Ownership { .. })
        ));
        assert!(!server.dir().join("w1.sock").exists());
        assert_eq!(server.allocated(), 0);

        // The name was never recorded, so a retry may still allocate it.
        assert!(server.allocate("w1", getgid()).is_ok());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let (server, _rx) = server(tmp.path());

        std::fs::write(server.dir().join("w1.sock"), b"stale").unwrap();
        let path = server.allocate("w1", getgid()).unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
    }
}
