//! Wire shapes of the GitHub REST objects we mirror.
//!
//! Only the fields that end up in a snapshot are modelled. Every field has a
//! default so that an unexpected `null` or a missing key degrades to an empty
//! value rather than failing the whole page. The same shapes are embedded in
//! webhook payloads (`issue`, `pull_request`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IssueSnapshot, ProjectId, PullRequestSnapshot};

/// A user reference (`user`, `assignees[]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub login: String,
}

/// A label attached to an issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// An item from `GET /repos/{owner}/{repo}/issues` or a webhook `issue`.
///
/// The issues endpoint also returns pull requests; those carry a
/// `pull_request` object, which is why it is kept as an opaque marker.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawIssue {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: Option<UserRef>,
    #[serde(default)]
    pub assignees: Option<Vec<UserRef>>,
    #[serde(default)]
    pub labels: Option<Vec<LabelRef>>,
    /// Comment count.
    #[serde(default)]
    pub comments: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl RawIssue {
    /// True when the issues endpoint returned a pull request.
    pub fn is_pull_request(&self) -> bool {
        matches!(&self.pull_request, Some(v) if !v.is_null())
    }

    pub fn comment_count(&self) -> i64 {
        self.comments.unwrap_or(0)
    }

    /// Builds a snapshot carrying only the scalar fields. Stored lists are
    /// left untouched by the upsert.
    pub fn to_scalar_snapshot(&self, project_id: ProjectId, seen: DateTime<Utc>) -> IssueSnapshot {
        IssueSnapshot {
            project_id,
            github_id: self.id,
            number: self.number,
            state: self.state.clone(),
            title: self.title.clone(),
            body: self.body.clone().unwrap_or_default(),
            author_login: self.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
            url: self.html_url.clone(),
            assignees: None,
            labels: None,
            comments_count: None,
            comments: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            last_seen_at: seen,
        }
    }

    /// Builds a complete snapshot from a bulk listing plus its fetched comments.
    pub fn to_full_snapshot(
        &self,
        project_id: ProjectId,
        comments: &[RawComment],
        seen: DateTime<Utc>,
    ) -> Result<IssueSnapshot, serde_json::Error> {
        let mut snapshot = self.to_scalar_snapshot(project_id, seen);
        snapshot.assignees = Some(serde_json::to_value(
            self.assignees.as_deref().unwrap_or_default(),
        )?);
        snapshot.labels = Some(serde_json::to_value(self.labels.as_deref().unwrap_or_default())?);
        snapshot.comments_count = Some(self.comment_count());
        snapshot.comments = Some(serde_json::to_value(comments)?);
        Ok(snapshot)
    }
}

/// An item from `GET /repos/{owner}/{repo}/pulls` or a webhook `pull_request`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPull {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: Option<UserRef>,
    /// Present in webhook payloads and single-PR responses, absent from lists.
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl RawPull {
    /// The list endpoint omits `merged`; a merge timestamp implies it.
    pub fn is_merged(&self) -> bool {
        self.merged.unwrap_or(false) || self.merged_at.is_some()
    }

    pub fn to_snapshot(&self, project_id: ProjectId, seen: DateTime<Utc>) -> PullRequestSnapshot {
        PullRequestSnapshot {
            project_id,
            github_id: self.id,
            number: self.number,
            state: self.state.clone(),
            title: self.title.clone(),
            body: self.body.clone().unwrap_or_default(),
            author_login: self.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
            url: self.html_url.clone(),
            merged: self.is_merged(),
            merged_at: self.merged_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            last_seen_at: seen,
        }
    }
}

/// An item from `GET /repos/{owner}/{repo}/issues/{number}/comments`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawComment {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<UserRef>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}
