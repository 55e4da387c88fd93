#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! Termination signals end the parent's task group cleanly.
//!
//! Signals are process-wide, so this binary holds a single test.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, raise};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use bouncer_daemon::control::ControlSocketServer;
use bouncer_daemon::orchestrator::{
    Outcome, SignalListener, TaskError, TaskGroup, Termination, resolve,
};
use bouncer_daemon::worker::{ExecLauncher, WorkerManager};

#[tokio::test]
async fn sigterm_with_no_workers_is_a_clean_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let mut group = TaskGroup::new(cancel.clone());

    let signals = SignalListener::install().unwrap();
    group.spawn("signals", signals.wait(cancel.clone()));

    let (conns_tx, _conns_rx) = mpsc::channel(1);
    let control =
        Arc::new(ControlSocketServer::new(tmp.path().join("sockets"), conns_tx).unwrap());
    let (manager, _handle) = WorkerManager::new(
        Arc::clone(&control),
        ExecLauncher::new("/bin/true"),
        cancel.clone(),
    );
    let (interrupted_tx, interrupted_rx) = oneshot::channel();
    group.spawn("worker-manager", async move {
        let _ = interrupted_tx.send(manager.run().await);
        Ok(())
    });

    raise(Signal::SIGTERM).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), group.wait())
        .await
        .expect("group stops after SIGTERM");
    assert!(matches!(
        result,
        Err(TaskError::Terminated(Termination::Terminate))
    ));
    control.close();

    assert_eq!(
        resolve(result).unwrap(),
        Outcome::Signalled(Termination::Terminate)
    );
    assert_eq!(interrupted_rx.await.unwrap(), 0);
    assert!(cancel.is_cancelled());
}
