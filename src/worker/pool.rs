//! A fixed set of sync workers sharing one runner and one shutdown token.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::poll::PollConfig;
use super::sync::JobRunner;
use super::worker::SyncWorker;
use crate::types::WorkerId;

pub struct WorkerPool {
    handles: Vec<(WorkerId, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Spawns `count` workers (at least one), identified `{base}#{index}`.
    pub fn spawn(
        base: &WorkerId,
        count: usize,
        runner: JobRunner,
        config: PollConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|index| {
                let worker =
                    SyncWorker::new(base.with_suffix(index), runner.clone(), config.clone());
                let id = worker.id().clone();
                let handle = tokio::spawn(worker.run(shutdown.clone()));
                (id, handle)
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), base = %base, "worker pool started");
        WorkerPool { handles }
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.handles.iter().map(|(id, _)| id)
    }

    /// Waits for every worker to exit. Callers cancel the shutdown token first.
    pub async fn join(self) {
        for (id, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(worker = %id, error = %e, "worker task panicked");
            }
        }
    }
}
