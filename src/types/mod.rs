//! Core domain types shared by the receiver, ingestor, store and workers.

pub mod ids;
pub mod job;
pub mod snapshot;

pub use ids::{DeliveryId, InvalidFullName, JobId, ProjectId, RepoFullName, WorkerId};
pub use job::{InvalidTransition, JobKind, JobOutcome, JobStatus, SyncJob};
pub use snapshot::{IssueSnapshot, Project, PullRequestSnapshot, WebhookDelivery};
