//! Parent-process task wiring.

use std::sync::Arc;

use bouncer_core::{BouncerConfig, Dataset};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control::ControlSocketServer;
use crate::decisions::{LapiStream, apply_decisions, run_stream};
use crate::router::Router;
use crate::worker::{ExecLauncher, WorkerIdentity, WorkerManager, WorkerSpec};

use super::{Outcome, SignalListener, TaskError, TaskGroup, resolve};

const DECISION_QUEUE: usize = 16;
const UPDATE_QUEUE: usize = 256;
const CONNECTION_QUEUE: usize = 16;

/// Run the parent until a termination signal or the first task failure.
///
/// Tasks: signal listener, decision stream, dataset updater, worker manager
/// and router, all sharing one cancellation scope. Every configured worker
/// is submitted once the tasks are running. The rendezvous sockets are
/// released before returning, on every path.
pub async fn run_parent(config: BouncerConfig, identity: WorkerIdentity) -> anyhow::Result<Outcome> {
    let signals = SignalListener::install()?;
    let stream = LapiStream::new(&config.api)?;

    let cancel = CancellationToken::new();
    let mut group = TaskGroup::new(cancel.clone());
    group.spawn("signals", signals.wait(cancel.clone()));

    let (batches_tx, batches_rx) = mpsc::channel(DECISION_QUEUE);
    group.spawn("decision-stream", run_stream(stream, batches_tx, cancel.clone()));

    let dataset = Arc::new(RwLock::new(Dataset::new()));
    let (updates, _) = broadcast::channel(UPDATE_QUEUE);
    group.spawn(
        "decision-updater",
        apply_decisions(batches_rx, Arc::clone(&dataset), updates.clone(), cancel.clone()),
    );

    let (conns_tx, conns_rx) = mpsc::channel(CONNECTION_QUEUE);
    let control = Arc::new(ControlSocketServer::new(config.worker_socket_dir.clone(), conns_tx)?);

    let launcher = ExecLauncher::current_exe()?;
    let (manager, handle) = WorkerManager::new(Arc::clone(&control), launcher, cancel.clone());
    group.spawn("worker-manager", async move {
        manager.run().await;
        Ok::<(), TaskError>(())
    });

    group.spawn("router", Router::new(dataset, updates).run(conns_rx, cancel.clone()));

    for worker in &config.workers {
        let spec = WorkerSpec::from_config(worker, identity).with_log_json(config.log_json);
        if let Err(e) = handle.submit(spec) {
            warn!(worker = %worker.name, error = %e, "Failed to submit worker");
        }
    }
    info!(workers = config.workers.len(), tasks = group.len(), "Bouncer started");

    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Failed to notify service manager");
    }

    let result = group.wait().await;
    control.close();
    Ok(resolve(result)?)
}
