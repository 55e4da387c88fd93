//! Worker side of the rendezvous socket.

use std::path::Path;
use std::sync::Arc;

use bouncer_core::{ControlMessage, Dataset};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::TaskError;

/// Connect to `socket` and apply every control message to `dataset` until
/// `cancel` fires.
///
/// Failing to connect is fatal to the worker. Once attached, losing the
/// parent only stops updates: the worker keeps serving the last dataset it
/// received until it is told to stop.
pub async fn run(
    socket: &Path,
    dataset: Arc<RwLock<Dataset>>,
    cancel: CancellationToken,
) -> Result<(), TaskError> {
    let stream = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        connected = UnixStream::connect(socket) => connected
            .map_err(|e| TaskError::failed("control-client", e))?,
    };
    info!(socket = %socket.display(), "Connected to control plane");

    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => apply_line(&line, &dataset).await,
            Ok(None) => {
                warn!("Control plane closed the connection, keeping current decisions");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Control plane read failed, keeping current decisions");
                break;
            }
        }
    }
    cancel.cancelled().await;
    Ok(())
}

async fn apply_line(line: &str, dataset: &RwLock<Dataset>) {
    if line.trim().is_empty() {
        return;
    }
    match ControlMessage::from_line(line) {
        Ok(message) => {
            let count = message.len();
            let mut data = dataset.write().await;
            message.apply(&mut data);
            debug!(decisions = count, total = data.len(), "Applied control message");
        }
        Err(e) => warn!(error = %e, "Ignoring malformed control message"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use bouncer_core::Decision;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn applies_snapshot_and_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("w1.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let dataset = Arc::new(RwLock::new(Dataset::new()));
        let cancel = CancellationToken::new();

        let task = {
            let path = path.clone();
            let dataset = Arc::clone(&dataset);
            let cancel = cancel.clone();
            tokio::spawn(async move { run(&path, dataset, cancel).await })
        };

        let (mut parent, _) = listener.accept().await.unwrap();
        let snapshot = ControlMessage::Snapshot {
            decisions: vec![
                Decision::new("Ip", "192.0.2.1", "ban"),
                Decision::new("Ip", "192.0.2.2", "ban"),
            ],
        };
        let deleted = ControlMessage::Deleted {
            decisions: vec![Decision::new("Ip", "192.0.2.1", "ban")],
        };
        parent.write_all(snapshot.to_line().unwrap().as_bytes()).await.unwrap();
        parent.write_all(b"not json\n").await.unwrap();
        parent.write_all(deleted.to_line().unwrap().as_bytes()).await.unwrap();
        drop(parent);

        tokio::time::timeout(Duration::from_secs(5), async {
            while dataset.read().await.len() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dataset updated");
        assert_eq!(dataset.read().await.lookup("ip", "192.0.2.2"), Some("ban"));

        // The parent is gone but the task waits for cancellation.
        assert!(!task.is_finished());
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn missing_socket_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = run(
            &tmp.path().join("absent.sock"),
            Arc::new(RwLock::new(Dataset::new())),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("control-client failed"));
    }
}
