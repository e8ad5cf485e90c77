//! The durable sync job queue.
//!
//! # Claim protocol
//!
//! [`Store::claim_next`] opens an `IMMEDIATE` transaction, which takes the
//! database write lock before reading. Inside it the oldest eligible row is
//! selected and flipped to `running` with this worker's identity, then the
//! transaction commits. Any other connection attempting a claim blocks on
//! the lock (up to `busy_timeout`) and then sees the row already running, so
//! it moves on to the next one. Two workers therefore never claim the same
//! job, and a worker never waits on a row another worker holds.
//!
//! A row is eligible when it is `pending` with `run_at <= now`, or when it is
//! `running` with a lease older than the configured lease duration. The
//! second case recovers jobs abandoned by a crashed worker.
//!
//! # Completion fencing
//!
//! [`Store::complete`] only updates a row that is still `running` and still
//! locked by the completing worker. If the lease was reclaimed in the
//! meantime, the late completion is dropped and reported as not applied.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Result, Store, StoreError, from_millis, opt_from_millis, to_millis};
use crate::types::{JobId, JobKind, JobOutcome, JobStatus, ProjectId, SyncJob, WorkerId};

/// Maximum number of rows returned by [`Store::recent_jobs`].
pub const RECENT_JOBS_LIMIT: usize = 50;

const JOB_COLUMNS: &str = "id, project_id, job_type, status, run_at, attempts, last_error, \
                           locked_by, locked_at, created_at, updated_at";

/// Raw column values, decoded into a [`SyncJob`] outside the rusqlite closure
/// so decode failures surface as [`StoreError::Corrupt`].
struct JobRow {
    id: String,
    project_id: String,
    job_type: String,
    status: String,
    run_at: i64,
    attempts: i64,
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(JobRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            job_type: row.get(2)?,
            status: row.get(3)?,
            run_at: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            locked_by: row.get(7)?,
            locked_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<SyncJob> {
        let id = Uuid::parse_str(&self.id).map_err(|_| StoreError::corrupt("id", &self.id))?;
        let project_id = self
            .project_id
            .parse::<ProjectId>()
            .map_err(|_| StoreError::corrupt("project_id", &self.project_id))?;
        let kind = JobKind::parse(&self.job_type)
            .ok_or_else(|| StoreError::corrupt("job_type", &self.job_type))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::corrupt("status", &self.status))?;
        let attempts =
            u32::try_from(self.attempts).map_err(|_| StoreError::corrupt("attempts", self.attempts))?;

        Ok(SyncJob {
            id: JobId(id),
            project_id,
            kind,
            status,
            run_at: from_millis("run_at", self.run_at)?,
            attempts,
            last_error: self.last_error,
            locked_by: self.locked_by.map(WorkerId::new),
            locked_at: opt_from_millis("locked_at", self.locked_at)?,
            created_at: from_millis("created_at", self.created_at)?,
            updated_at: from_millis("updated_at", self.updated_at)?,
        })
    }
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

impl Store {
    /// Inserts one `pending` job per kind, runnable immediately.
    pub async fn enqueue(
        &self,
        project_id: ProjectId,
        kinds: &[JobKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>> {
        let kinds = kinds.to_vec();
        self.with_conn("enqueue", move |conn| {
            let tx = conn.transaction()?;
            let mut jobs = Vec::with_capacity(kinds.len());
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO sync_jobs \
                     (id, project_id, job_type, status, run_at, attempts, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?4, ?4)",
                )?;
                for kind in kinds {
                    let job = SyncJob {
                        id: JobId::new(),
                        project_id,
                        kind,
                        status: JobStatus::Pending,
                        run_at: now,
                        attempts: 0,
                        last_error: None,
                        locked_by: None,
                        locked_at: None,
                        created_at: now,
                        updated_at: now,
                    };
                    stmt.execute(params![
                        job.id.to_string(),
                        project_id.to_string(),
                        kind.as_str(),
                        to_millis(now),
                    ])?;
                    jobs.push(job);
                }
            }
            tx.commit()?;
            Ok(jobs)
        })
        .await
    }

    /// Atomically claims the oldest runnable job for `worker`.
    ///
    /// Returns `None` when nothing is runnable. See the module docs for the
    /// locking protocol.
    pub async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<SyncJob>> {
        let worker = worker.clone();
        self.with_conn("claim_next", move |conn| {
            let now_ms = to_millis(now);
            let stale_before = now_ms.saturating_sub(lease_millis(lease));

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = tx
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM sync_jobs \
                         WHERE (status = 'pending' AND run_at <= ?1) \
                            OR (status = 'running' AND locked_at IS NOT NULL AND locked_at <= ?2) \
                         ORDER BY run_at ASC, rowid ASC \
                         LIMIT 1"
                    ),
                    params![now_ms, stale_before],
                    JobRow::from_row,
                )
                .optional()?;

            let Some(row) = row else {
                return Ok(None);
            };
            let mut job = row.decode()?;

            if job.status == JobStatus::Running {
                warn!(
                    job_id = %job.id,
                    previous_owner = ?job.locked_by,
                    worker = %worker,
                    "reclaiming job with expired lease"
                );
            }
            job.status = job.status.transition(JobStatus::Running)?;

            tx.execute(
                "UPDATE sync_jobs \
                 SET status = 'running', locked_by = ?2, locked_at = ?3, updated_at = ?3 \
                 WHERE id = ?1",
                params![job.id.to_string(), worker.as_str(), now_ms],
            )?;
            tx.commit()?;

            job.locked_by = Some(worker);
            job.locked_at = Some(now);
            job.updated_at = now;
            debug!(job_id = %job.id, kind = %job.kind, "claimed job");
            Ok(Some(job))
        })
        .await
    }

    /// Records the outcome of a claimed job.
    ///
    /// Increments `attempts`, sets `last_error` from the outcome (cleared on
    /// success) and moves the job to its terminal status. Returns `false` when
    /// the row is no longer running under `worker`, in which case nothing is
    /// written.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let worker = worker.clone();
        self.with_conn("complete", move |conn| {
            let status = JobStatus::Running.transition(outcome.status())?;
            let changed = conn.execute(
                "UPDATE sync_jobs \
                 SET status = ?2, attempts = attempts + 1, last_error = ?3, updated_at = ?4 \
                 WHERE id = ?1 AND status = 'running' AND locked_by = ?5",
                params![
                    job_id.to_string(),
                    status.as_str(),
                    outcome.error(),
                    to_millis(now),
                    worker.as_str(),
                ],
            )?;
            if changed == 0 {
                warn!(job_id = %job_id, worker = %worker, "job lease lost before completion");
            }
            Ok(changed > 0)
        })
        .await
    }

    /// Loads one job by ID.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<SyncJob>> {
        self.with_conn("get_job", move |conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?1"),
                params![job_id.to_string()],
                JobRow::from_row,
            )
            .optional()?
            .map(JobRow::decode)
            .transpose()
        })
        .await
    }

    /// The most recently created jobs for a project, newest first.
    pub async fn recent_jobs(&self, project_id: ProjectId, limit: usize) -> Result<Vec<SyncJob>> {
        let limit = i64::try_from(limit.min(RECENT_JOBS_LIMIT)).unwrap_or(50);
        self.with_conn("recent_jobs", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE project_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![project_id.to_string(), limit], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(JobRow::decode).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::store::test_support::{at, project, temp_store};

    const LEASE: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn enqueue_creates_pending_jobs() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;

        let jobs = store.enqueue(p.id, &JobKind::ALL, at(0)).await.unwrap();
        assert_eq!(jobs.len(), 2);

        for job in &jobs {
            let stored = store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Pending);
            assert_eq!(stored.attempts, 0);
            assert_eq!(stored.run_at, at(0));
            assert!(stored.locked_by.is_none());
        }
    }

    #[tokio::test]
    async fn claim_marks_running_and_stamps_owner() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let [job] = store
            .enqueue(p.id, &[JobKind::SyncIssues], at(0))
            .await
            .unwrap()
            .try_into()
            .unwrap();

        let worker = WorkerId::new("w1");
        let claimed = store.claim_next(&worker, at(1), LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.locked_by, Some(worker.clone()));
        assert_eq!(stored.locked_at, Some(at(1)));

        assert!(store.claim_next(&worker, at(2), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_takes_oldest_run_at_first() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let later = store.enqueue(p.id, &[JobKind::SyncPrs], at(10)).await.unwrap();
        let earlier = store.enqueue(p.id, &[JobKind::SyncIssues], at(5)).await.unwrap();

        let worker = WorkerId::new("w1");
        let first = store.claim_next(&worker, at(20), LEASE).await.unwrap().unwrap();
        let second = store.claim_next(&worker, at(20), LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, earlier[0].id);
        assert_eq!(second.id, later[0].id);
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        store.enqueue(p.id, &[JobKind::SyncIssues], at(60)).await.unwrap();

        let worker = WorkerId::new("w1");
        assert!(store.claim_next(&worker, at(30), LEASE).await.unwrap().is_none());
        assert!(store.claim_next(&worker, at(60), LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn complete_success_clears_error_and_counts_attempt() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        store.enqueue(p.id, &[JobKind::SyncIssues], at(0)).await.unwrap();
        let worker = WorkerId::new("w1");
        let job = store.claim_next(&worker, at(1), LEASE).await.unwrap().unwrap();

        let applied = store
            .complete(job.id, &worker, JobOutcome::Completed, at(2))
            .await
            .unwrap();
        assert!(applied);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error, None);
        assert_eq!(stored.updated_at, at(2));
    }

    #[tokio::test]
    async fn complete_failure_records_error() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        store.enqueue(p.id, &[JobKind::SyncPrs], at(0)).await.unwrap();
        let worker = WorkerId::new("w1");
        let job = store.claim_next(&worker, at(1), LEASE).await.unwrap().unwrap();

        store
            .complete(
                job.id,
                &worker,
                JobOutcome::Failed("github status 500".into()),
                at(2),
            )
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("github status 500"));

        // Failed jobs are terminal and never picked up again.
        assert!(store.claim_next(&worker, at(10_000), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_stale_completion_dropped() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        store.enqueue(p.id, &[JobKind::SyncIssues], at(0)).await.unwrap();

        let crashed = WorkerId::new("crashed");
        let job = store.claim_next(&crashed, at(1), LEASE).await.unwrap().unwrap();

        let rescuer = WorkerId::new("rescuer");
        // Still within the lease.
        assert!(store.claim_next(&rescuer, at(100), LEASE).await.unwrap().is_none());

        let reclaimed = store.claim_next(&rescuer, at(1 + 900), LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.locked_by, Some(rescuer.clone()));

        let late = store
            .complete(job.id, &crashed, JobOutcome::Failed("late".into()), at(1000))
            .await
            .unwrap();
        assert!(!late);

        assert!(store
            .complete(job.id, &rescuer, JobOutcome::Completed, at(1001))
            .await
            .unwrap());
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn recent_jobs_newest_first_and_capped() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        let other = project(&store, "acme/gadgets").await;
        for i in 0..30 {
            store.enqueue(p.id, &JobKind::ALL, at(i)).await.unwrap();
        }
        store.enqueue(other.id, &JobKind::ALL, at(100)).await.unwrap();

        let jobs = store.recent_jobs(p.id, 500).await.unwrap();
        assert_eq!(jobs.len(), RECENT_JOBS_LIMIT);
        assert!(jobs.iter().all(|j| j.project_id == p.id));
        assert_eq!(jobs[0].created_at, at(29));
        assert!(jobs.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_exclusive() {
        const WORKERS: usize = 4;
        const JOBS: usize = 40;

        let (store, dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        for i in 0..(JOBS / 2) {
            store.enqueue(p.id, &JobKind::ALL, at(i as i64)).await.unwrap();
        }

        let path = dir.path().join("mirror.db");
        let mut handles = Vec::new();
        for w in 0..WORKERS {
            // One connection per worker, as separate processes would have.
            let store = Store::open(&path).unwrap();
            let worker = WorkerId::new(format!("w{w}"));
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(&worker, at(10_000), LEASE).await.unwrap() {
                    store
                        .complete(job.id, &worker, JobOutcome::Completed, at(10_001))
                        .await
                        .unwrap();
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, JOBS);

        for job in store.recent_jobs(p.id, 50).await.unwrap() {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.attempts, 1);
        }
    }
}
