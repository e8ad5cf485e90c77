//! Sync job types and the job status state machine.
//!
//! ```text
//! pending ──claim──▶ running ──┬──▶ completed
//!                              └──▶ failed
//! ```
//!
//! `failed` is terminal. A new job of the same kind has to be enqueued
//! independently (by a later webhook or an explicit sync request).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ids::{JobId, ProjectId, WorkerId};

/// The entity collection a job reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SyncIssues,
    SyncPrs,
}

impl JobKind {
    /// Every tracked kind. A reconciling pass enqueues one job per entry.
    pub const ALL: [JobKind; 2] = [JobKind::SyncIssues, JobKind::SyncPrs];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncIssues => "sync_issues",
            JobKind::SyncPrs => "sync_prs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_issues" => Some(JobKind::SyncIssues),
            "sync_prs" => Some(JobKind::SyncPrs),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// An attempted status change that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Checks a transition against the state machine.
    ///
    /// `running -> running` is allowed: it is how an expired lease is reclaimed
    /// by another worker.
    pub fn transition(self, to: JobStatus) -> Result<JobStatus, InvalidTransition> {
        let allowed = match self {
            JobStatus::Pending => to == JobStatus::Running,
            JobStatus::Running => to != JobStatus::Pending,
            _ => !self.is_terminal(),
        };
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub project_id: ProjectId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a job attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Failed(message) => Some(message),
        }
    }
}
