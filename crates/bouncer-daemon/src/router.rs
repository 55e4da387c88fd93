//! Routing layer: forwards decisions to connected workers.
//!
//! Each worker connection accepted by the control-socket server gets a
//! snapshot of the parent's dataset, then every subsequent update, as NDJSON
//! control messages.

use std::sync::Arc;

use bouncer_core::{ControlMessage, Dataset};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::control::SocketConn;
use crate::orchestrator::TaskError;

/// Routes control-plane pushes to workers.
#[derive(Clone)]
pub struct Router {
    dataset: Arc<RwLock<Dataset>>,
    updates: broadcast::Sender<ControlMessage>,
}

impl Router {
    pub const fn new(dataset: Arc<RwLock<Dataset>>, updates: broadcast::Sender<ControlMessage>) -> Self {
        Self { dataset, updates }
    }

    /// Serve worker connections from `conns` until `cancel` fires.
    pub async fn run(
        self,
        mut conns: mpsc::Receiver<SocketConn>,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        let forwarders = TaskTracker::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                conn = conns.recv() => match conn {
                    Some(conn) => {
                        // Subscribe before the snapshot is taken so no update
                        // falls between the two.
                        let updates = self.updates.subscribe();
                        forwarders.spawn(forward(
                            conn,
                            Arc::clone(&self.dataset),
                            updates,
                            cancel.clone(),
                        ));
                    }
                    None => {
                        cancel.cancelled().await;
                        break;
                    }
                }
            }
        }
        forwarders.close();
        forwarders.wait().await;
        debug!("Router stopped");
        Ok(())
    }
}

async fn forward(
    conn: SocketConn,
    dataset: Arc<RwLock<Dataset>>,
    mut updates: broadcast::Receiver<ControlMessage>,
    cancel: CancellationToken,
) {
    let SocketConn { worker, stream } = conn;
    let (mut reader, mut writer) = stream.into_split();

    let snapshot = snapshot_of(&dataset).await;
    let count = snapshot.len();
    if let Err(e) = send(&mut writer, &snapshot).await {
        warn!(worker = %worker, error = %e, "Failed to send snapshot to worker");
        return;
    }
    info!(worker = %worker, decisions = count, "Worker attached to control plane");

    // Workers never send anything; a read only completes on disconnect.
    let mut buf = [0u8; 64];
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        info!(worker = %worker, "Worker detached from control plane");
                        break;
                    }
                    Ok(_) => continue,
                }
            }
            update = updates.recv() => match update {
                Ok(message) => send(&mut writer, &message).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(worker = %worker, skipped, "Worker lagged behind updates, resending snapshot");
                    send(&mut writer, &snapshot_of(&dataset).await).await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        };
        if let Err(e) = result {
            warn!(worker = %worker, error = %e, "Failed to push update to worker");
            break;
        }
    }
}

async fn snapshot_of(dataset: &RwLock<Dataset>) -> ControlMessage {
    ControlMessage::Snapshot {
        decisions: dataset.read().await.snapshot(),
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: &ControlMessage) -> std::io::Result<()> {
    let line = message.to_line().map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await
}
