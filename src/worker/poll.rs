//! Polling and job execution settings for sync workers.
//!
//! # Polling Strategy
//!
//! - **Poll interval**: 1 second by default (`WORKER_POLL_INTERVAL_MS`)
//! - **Jitter**: 0-20% added per worker so a restarted pool does not poll in lockstep
//! - **Job timeout**: 10 minutes per attempt (`SYNC_JOB_TIMEOUT_SECS`)
//! - **Lease**: a `running` job untouched for 15 minutes may be reclaimed (`SYNC_JOB_LEASE_SECS`)

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::types::WorkerId;

/// Default interval between claim attempts.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default bound on one job attempt.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;

/// Default age after which a `running` job is considered abandoned.
pub const DEFAULT_LEASE_SECS: u64 = 900;

/// Default jitter percentage (0-100).
const DEFAULT_JITTER_PERCENT: u8 = 20;

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Sleep between ticks that found nothing to do.
    pub poll_interval: Duration,

    /// An attempt still running after this is abandoned and marked failed.
    pub job_timeout: Duration,

    /// Claims older than this are open to other workers. Must exceed
    /// `job_timeout`, otherwise a slow but healthy job can be claimed twice.
    pub lease: Duration,

    /// Jitter percentage added to the poll interval (0-100).
    pub jitter_percent: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollConfig {
    pub fn new() -> Self {
        PollConfig {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// Returns the poll interval with jitter added for a specific worker.
    ///
    /// The jitter is deterministic in the worker identity.
    ///
    /// `interval * (1 + (hash(worker) % jitter_percent) / 100)`
    pub fn poll_interval_for(&self, worker: &WorkerId) -> Duration {
        if self.jitter_percent == 0 {
            return self.poll_interval;
        }
        let mut hasher = std::hash::DefaultHasher::new();
        worker.hash(&mut hasher);
        let jitter = (hasher.finish() % u64::from(self.jitter_percent)) as f64 / 100.0;
        self.poll_interval.mul_f64(1.0 + jitter)
    }
}
