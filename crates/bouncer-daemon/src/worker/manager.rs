//! Worker supervisor.
//!
//! [`WorkerManager::run`] is the only place the set of running workers is
//! touched: creation requests, exit notices and cancellation are all handled
//! on that one task, so the set needs no lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::RendezvousAllocator;

use super::{Handoff, Launcher, WorkerError, WorkerExit, WorkerProcess, WorkerSpec};

/// Lifecycle of one submitted worker, as published on its ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Queued, not yet picked up by the manager.
    Pending,
    /// Rendezvous socket being allocated and process being launched.
    Starting,
    Running { pid: Option<u32> },
    /// Process ended; `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// Refused before anything was allocated (invalid spec, duplicate name).
    Rejected { reason: String },
    /// Allocation, launch or wait failed.
    Failed { reason: String },
}

impl WorkerStatus {
    /// `true` once the manager has decided what happened to the spec.
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending | Self::Starting)
    }
}

/// Receipt for a submitted spec, carrying its status updates.
#[derive(Debug, Clone)]
pub struct WorkerTicket {
    pub name: String,
    status: watch::Receiver<WorkerStatus>,
}

impl WorkerTicket {
    /// Wait until the worker is running or has been turned down.
    pub async fn settled(&mut self) -> WorkerStatus {
        self.wait_for(WorkerStatus::is_settled).await
    }

    /// Wait until the worker's process has ended (or never started).
    pub async fn finished(&mut self) -> WorkerStatus {
        self.wait_for(|s| s.is_settled() && !matches!(s, WorkerStatus::Running { .. }))
            .await
    }

    async fn wait_for(&mut self, done: impl FnMut(&WorkerStatus) -> bool) -> WorkerStatus {
        let waited = self.status.wait_for(done).await.map(|status| status.clone());
        // Manager gone: the last published status is final.
        waited.unwrap_or_else(|_| self.status.borrow().clone())
    }
}

struct Request {
    spec: WorkerSpec,
    status: watch::Sender<WorkerStatus>,
}

/// Cloneable submission side of the manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("spec", &self.spec).finish()
    }
}

impl ManagerHandle {
    /// Queue `spec` for creation. Never blocks.
    ///
    /// Validation, allocation and launch outcomes are reported on the
    /// returned ticket, not here; the only error is a manager that has
    /// already stopped.
    pub fn submit(&self, spec: WorkerSpec) -> Result<WorkerTicket, WorkerError> {
        let (status, rx) = watch::channel(WorkerStatus::Pending);
        let name = spec.name.clone();
        self.requests
            .send(Request { spec, status })
            .map_err(|_| WorkerError::ManagerStopped)?;
        Ok(WorkerTicket { name, status: rx })
    }
}

struct RunningWorker<P> {
    spec: WorkerSpec,
    socket: PathBuf,
    process: P,
    status: watch::Sender<WorkerStatus>,
}

/// Supervisor owning every running worker.
pub struct WorkerManager<A, L: Launcher> {
    allocator: Arc<A>,
    launcher: L,
    cancel: CancellationToken,
    requests: mpsc::UnboundedReceiver<Request>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
    workers: HashMap<String, RunningWorker<L::Process>>,
    /// Every name a rendezvous socket was requested for during this run.
    names: HashSet<String>,
}

impl<A: RendezvousAllocator, L: Launcher> WorkerManager<A, L> {
    /// Create the manager and its submission handle. The manager stops
    /// every worker and returns from [`run`](Self::run) once `cancel` fires.
    pub fn new(allocator: Arc<A>, launcher: L, cancel: CancellationToken) -> (Self, ManagerHandle) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let manager = Self {
            allocator,
            launcher,
            cancel,
            requests,
            exits_tx,
            exits,
            workers: HashMap::new(),
            names: HashSet::new(),
        };
        (
            manager,
            ManagerHandle {
                requests: requests_tx,
            },
        )
    }

    /// Serve creation requests until cancelled, then interrupt every running
    /// worker. Returns the number of interrupts sent; does not wait for the
    /// workers to exit.
    pub async fn run(mut self) -> usize {
        info!("Worker manager started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(exit) = self.exits.recv() => self.reap(exit),
                Some(request) = self.requests.recv() => self.start(request),
            }
        }
        // Exits already queued must not be interrupted after their reap.
        while let Ok(exit) = self.exits.try_recv() {
            self.reap(exit);
        }
        let interrupted = self.stop();
        info!(interrupted, "Worker manager stopped");
        interrupted
    }

    fn start(&mut self, request: Request) {
        let Request { spec, status } = request;

        if let Err(e) = spec.validate() {
            warn!(worker = %spec.name, error = %e, "Rejected worker spec");
            status.send_replace(WorkerStatus::Rejected {
                reason: e.to_string(),
            });
            return;
        }
        if !self.names.insert(spec.name.clone()) {
            let e = WorkerError::DuplicateName(spec.name.clone());
            warn!(worker = %spec.name, error = %e, "Rejected worker spec");
            status.send_replace(WorkerStatus::Rejected {
                reason: e.to_string(),
            });
            return;
        }

        status.send_replace(WorkerStatus::Starting);

        let socket = match self.allocator.allocate(&spec.name, spec.gid) {
            Ok(path) => path,
            Err(e) => {
                let e = WorkerError::from(e);
                error!(worker = %spec.name, error = %e, "Failed to create worker listener");
                status.send_replace(WorkerStatus::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let handoff = Handoff::new(&spec, socket.clone());
        match self.launcher.launch(&spec, &handoff, self.exits_tx.clone()) {
            Ok(process) => {
                let pid = process.pid();
                debug!(worker = %spec.name, pid = ?pid, socket = %socket.display(), "Worker tracked");
                status.send_replace(WorkerStatus::Running { pid });
                self.workers.insert(
                    spec.name.clone(),
                    RunningWorker {
                        spec,
                        socket,
                        process,
                        status,
                    },
                );
            }
            Err(e) => {
                error!(worker = %spec.name, error = %e, "Failed to start worker");
                status.send_replace(WorkerStatus::Failed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Drop an exited worker from the running set and publish its outcome.
    fn reap(&mut self, exit: WorkerExit) {
        let Some(worker) = self.workers.remove(&exit.name) else {
            debug!(worker = %exit.name, "Exit notice for untracked worker");
            return;
        };
        debug!(
            worker = %worker.spec.name,
            socket = %worker.socket.display(),
            outcome = ?exit.outcome,
            "Worker untracked"
        );
        let status = match exit.outcome {
            Ok(code) => WorkerStatus::Exited { code },
            Err(reason) => WorkerStatus::Failed { reason },
        };
        worker.status.send_replace(status);
    }

    fn stop(&mut self) -> usize {
        let mut interrupted = 0;
        for (name, worker) in &self.workers {
            match worker.process.interrupt() {
                Ok(()) => {
                    debug!(worker = %name, pid = ?worker.process.pid(), "Sent interrupt to worker");
                    interrupted += 1;
                }
                Err(e) => warn!(worker = %name, error = %e, "Failed to interrupt worker"),
            }
        }
        interrupted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::unistd::Gid;

    use super::*;
    use crate::control::ControlError;
    use crate::worker::WorkerIdentity;

    #[derive(Default)]
    struct CountingAllocator {
        calls: Mutex<Vec<String>>,
    }

    impl RendezvousAllocator for CountingAllocator {
        fn allocate(&self, worker: &str, _gid: Gid) -> Result<PathBuf, ControlError> {
            self.calls.lock().unwrap().push(worker.to_string());
            Ok(PathBuf::from(format!("/run/test/{worker}.sock")))
        }
    }

    struct StubProcess {
        interrupts: Arc<AtomicUsize>,
    }

    impl WorkerProcess for StubProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn interrupt(&self) -> Result<(), WorkerError> {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Launches nothing; workers stay "running" until an exit is injected.
    #[derive(Default)]
    struct StubLauncher {
        interrupts: Arc<AtomicUsize>,
        exits: Arc<Mutex<Option<mpsc::UnboundedSender<WorkerExit>>>>,
    }

    impl Launcher for StubLauncher {
        type Process = StubProcess;

        fn launch(
            &self,
            _spec: &WorkerSpec,
            _handoff: &Handoff,
            exits: mpsc::UnboundedSender<WorkerExit>,
        ) -> Result<StubProcess, WorkerError> {
            *self.exits.lock().unwrap() = Some(exits);
            Ok(StubProcess {
                interrupts: Arc::clone(&self.interrupts),
            })
        }
    }

    fn tcp_spec(name: &str) -> WorkerSpec {
        WorkerSpec::new(name, WorkerIdentity::current()).with_tcp("127.0.0.1:9000".parse().unwrap())
    }

    #[tokio::test]
    async fn exited_worker_is_pruned() {
        let allocator = Arc::new(CountingAllocator::default());
        let launcher = StubLauncher::default();
        let interrupts = Arc::clone(&launcher.interrupts);
        let exits = Arc::clone(&launcher.exits);
        let cancel = CancellationToken::new();
        let (manager, handle) = WorkerManager::new(allocator, launcher, cancel.clone());
        let run = tokio::spawn(manager.run());

        let mut ticket = handle.submit(tcp_spec("w1")).unwrap();
        assert_eq!(ticket.settled().await, WorkerStatus::Running { pid: Some(4242) });

        let sender = exits.lock().unwrap().clone().expect("launched");
        sender
            .send(WorkerExit {
                name: "w1".into(),
                outcome: Ok(Some(3)),
            })
            .unwrap();
        assert_eq!(ticket.finished().await, WorkerStatus::Exited { code: Some(3) });

        cancel.cancel();
        assert_eq!(run.await.unwrap(), 0);
        assert_eq!(interrupts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exit_queued_with_cancellation_is_not_interrupted() {
        let launcher = StubLauncher::default();
        let interrupts = Arc::clone(&launcher.interrupts);
        let exits = Arc::clone(&launcher.exits);
        let cancel = CancellationToken::new();
        let (manager, handle) = WorkerManager::new(
            Arc::new(CountingAllocator::default()),
            launcher,
            cancel.clone(),
        );
        let run = tokio::spawn(manager.run());

        let mut ticket = handle.submit(tcp_spec("w1")).unwrap();
        assert!(matches!(ticket.settled().await, WorkerStatus::Running { .. }));

        // Both are pending before the manager runs again; cancellation wins
        // the select but the exit must still be reaped first.
        let sender = exits.lock().unwrap().clone().expect("launched");
        sender
            .send(WorkerExit {
                name: "w1".into(),
                outcome: Ok(Some(0)),
            })
            .unwrap();
        cancel.cancel();

        assert_eq!(run.await.unwrap(), 0);
        assert_eq!(interrupts.load(Ordering::SeqCst), 0);
        assert_eq!(ticket.finished().await, WorkerStatus::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let cancel = CancellationToken::new();
        let (manager, handle) = WorkerManager::new(
            Arc::new(CountingAllocator::default()),
            StubLauncher::default(),
            cancel.clone(),
        );
        cancel.cancel();
        assert_eq!(manager.run().await, 0);
        assert!(matches!(
            handle.submit(tcp_spec("late")),
            Err(WorkerError::ManagerStopped)
        ));
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_without_allocation() {
        let allocator = Arc::new(CountingAllocator::default());
        let cancel = CancellationToken::new();
        let (manager, handle) =
            WorkerManager::new(Arc::clone(&allocator), StubLauncher::default(), cancel.clone());
        let run = tokio::spawn(manager.run());

        let mut ticket = handle
            .submit(WorkerSpec::new("bare", WorkerIdentity::current()))
            .unwrap();
        assert!(matches!(ticket.settled().await, WorkerStatus::Rejected { .. }));
        assert!(allocator.calls.lock().unwrap().is_empty());

        cancel.cancel();
        run.await.unwrap();
    }
}
