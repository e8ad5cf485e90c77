//! The polling loop of one sync worker.
//!
//! # Tick
//!
//! 1. Claim the oldest runnable job (pending and due, or running with an expired lease)
//! 2. Run it under the per-job timeout
//! 3. Record `completed`, or `failed` with the error text
//!
//! A tick handles at most one job. The loop sleeps for the poll interval only
//! when a tick found nothing to do, so a backlog drains without idle gaps.
//! Errors never stop the loop; they are logged and the next tick proceeds.

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::poll::PollConfig;
use super::sync::{JobRunner, SyncError};
use crate::store::StoreError;
use crate::types::{JobId, JobOutcome, JobStatus, WorkerId};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No runnable job.
    Idle,

    /// A job ran to a terminal status. `recorded` is false when the lease was
    /// lost meanwhile and another worker now owns the row.
    Finished {
        job_id: JobId,
        status: JobStatus,
        recorded: bool,
    },
}

pub struct SyncWorker {
    id: WorkerId,
    runner: JobRunner,
    config: PollConfig,
}

impl SyncWorker {
    pub fn new(id: WorkerId, runner: JobRunner, config: PollConfig) -> Self {
        SyncWorker { id, runner, config }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claims and runs at most one job.
    #[instrument(skip(self, shutdown), fields(worker = %self.id))]
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<TickOutcome> {
        let store = self.runner.store();
        let Some(job) = store
            .claim_next(&self.id, Utc::now(), self.config.lease)
            .await?
        else {
            return Ok(TickOutcome::Idle);
        };

        let outcome =
            match tokio::time::timeout(self.config.job_timeout, self.runner.run(&job, shutdown))
                .await
            {
                Ok(Ok(_)) => JobOutcome::Completed,
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, kind = %job.kind, error = %e, "sync job failed");
                    JobOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    let e = SyncError::Timeout(self.config.job_timeout);
                    warn!(job_id = %job.id, kind = %job.kind, error = %e, "sync job timed out");
                    JobOutcome::Failed(e.to_string())
                }
            };

        let status = outcome.status();
        let recorded = store
            .complete(job.id, &self.id, outcome, Utc::now())
            .await?;
        debug!(job_id = %job.id, %status, recorded, "job finished");
        Ok(TickOutcome::Finished {
            job_id: job.id,
            status,
            recorded,
        })
    }

    /// Runs ticks until `shutdown` fires.
    ///
    /// Cancellation is observed between ticks and inside rate limit waits;
    /// an interrupted job is recorded as failed.
    #[instrument(skip(self, shutdown), fields(worker = %self.id))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Sync worker started");
        let idle_sleep = self.config.poll_interval_for(&self.id);

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let busy = match self.tick(&shutdown).await {
                Ok(TickOutcome::Finished { .. }) => true,
                Ok(TickOutcome::Idle) => false,
                Err(e) => {
                    error!(error = %e, "Error during tick");
                    false
                }
            };
            if busy {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle_sleep) => {}
            }
        }

        info!("Sync worker stopped");
    }
}
