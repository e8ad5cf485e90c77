//! Sync workers draining the job queue.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  claim_next   ┌────────────┐   rate-limited   ┌──────────┐
//! │ sync_jobs  │ ────────────► │ SyncWorker │ ───────────────► │  GitHub  │
//! │  (SQLite)  │ ◄──────────── │   tick()   │ ◄─────────────── │   REST   │
//! └────────────┘   complete    └────────────┘  pages, comments └──────────┘
//!                                    │
//!                                    ▼ upsert
//!                              snapshot tables
//! ```
//!
//! A [`WorkerPool`] owns one or more [`SyncWorker`]s, each polling with its
//! own identity. Several processes may share a database; the claim protocol
//! in [`crate::store::jobs`] keeps each job with a single holder.

pub mod poll;
pub mod pool;
pub mod sync;
#[allow(clippy::module_inception)]
pub mod worker;

pub use poll::PollConfig;
pub use pool::WorkerPool;
pub use sync::{JobRunner, MAX_PAGES, SyncError, SyncSummary};
pub use worker::{SyncWorker, TickOutcome};
