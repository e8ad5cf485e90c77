//! Snapshot rows mirrored from GitHub, the webhook audit record and the
//! (read-only) project record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{DeliveryId, ProjectId};

/// A tracked repository. Owned by the registration subsystem; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// `owner/repo` as registered.
    pub full_name: String,
    pub status: String,
    pub owner_user_id: Option<Uuid>,
}

/// One audit row per webhook delivery ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDelivery {
    pub delivery_id: DeliveryId,
    pub project_id: Option<ProjectId>,
    pub repo_full_name: String,
    pub event: String,
    pub action: Option<String>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Cached state of one GitHub issue.
///
/// `assignees`, `labels` and `comments` are opaque JSON blobs. `None` means
/// the source of this write did not carry the list, and the stored value is
/// kept as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub project_id: ProjectId,
    pub github_id: i64,
    pub number: i64,
    pub state: String,
    pub title: String,
    pub body: String,
    pub author_login: String,
    pub url: String,
    pub assignees: Option<serde_json::Value>,
    pub labels: Option<serde_json::Value>,
    pub comments_count: Option<i64>,
    pub comments: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
}

/// Cached state of one GitHub pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub project_id: ProjectId,
    pub github_id: i64,
    pub number: i64,
    pub state: String,
    pub title: String,
    pub body: String,
    pub author_login: String,
    pub url: String,
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
}
