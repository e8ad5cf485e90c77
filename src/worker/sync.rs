//! Execution of one sync job: a paginated, rate-limited bulk pass that
//! upserts every issue or pull request of a project.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::github::{
    AccessToken, CredentialError, CredentialProvider, GitHubApiError, HostingApi, RateLimitError,
    RateLimiter,
};
use crate::store::{Store, StoreError};
use crate::types::{InvalidFullName, JobKind, Project, ProjectId, RepoFullName, SyncJob};

/// Upper bound on pages fetched per job (5000 items at 100 per page).
pub const MAX_PAGES: u32 = 50;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error(transparent)]
    InvalidRepo(#[from] InvalidFullName),

    #[error("resolving credentials: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    GitHub(#[from] GitHubApiError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encoding snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

/// What a successful job did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// List pages requested, including the terminating empty one.
    pub pages: u32,
    pub upserted: u64,
    /// Pull requests returned by the issues endpoint.
    pub skipped: u64,
}

/// Runs claimed jobs against the hosting API.
#[derive(Clone)]
pub struct JobRunner {
    store: Store,
    api: Arc<dyn HostingApi>,
    credentials: Arc<dyn CredentialProvider>,
    limiter: Arc<RateLimiter>,
}

impl JobRunner {
    pub fn new(
        store: Store,
        api: Arc<dyn HostingApi>,
        credentials: Arc<dyn CredentialProvider>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        JobRunner {
            store,
            api,
            credentials,
            limiter,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind, project_id = %job.project_id))]
    pub async fn run(
        &self,
        job: &SyncJob,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let project = self
            .store
            .get_project(job.project_id)
            .await?
            .ok_or(SyncError::ProjectNotFound(job.project_id))?;
        let repo = RepoFullName::parse(&project.full_name)?;
        let token = self.credentials.token_for(&project).await?;

        let summary = match job.kind {
            JobKind::SyncIssues => self.sync_issues(&project, &repo, &token, cancel).await?,
            JobKind::SyncPrs => self.sync_prs(&project, &repo, &token, cancel).await?,
        };
        info!(
            repo = %repo,
            pages = summary.pages,
            upserted = summary.upserted,
            skipped = summary.skipped,
            "sync finished"
        );
        Ok(summary)
    }

    async fn sync_issues(
        &self,
        project: &Project,
        repo: &RepoFullName,
        token: &AccessToken,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();
        for page in 1..=MAX_PAGES {
            self.limiter.acquire(cancel).await?;
            let items = self.api.list_issues_page(token, repo, page).await?;
            summary.pages += 1;
            if items.is_empty() {
                break;
            }
            debug!(page, items = items.len(), "issues page");

            for item in &items {
                if item.is_pull_request() {
                    summary.skipped += 1;
                    continue;
                }
                let comments = if item.comment_count() > 0 {
                    self.limiter.acquire(cancel).await?;
                    self.api.list_issue_comments(token, repo, item.number).await?
                } else {
                    Vec::new()
                };
                let snapshot = item.to_full_snapshot(project.id, &comments, Utc::now())?;
                self.store.upsert_issue(&snapshot).await?;
                summary.upserted += 1;
            }
        }
        Ok(summary)
    }

    async fn sync_prs(
        &self,
        project: &Project,
        repo: &RepoFullName,
        token: &AccessToken,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();
        for page in 1..=MAX_PAGES {
            self.limiter.acquire(cancel).await?;
            let items = self.api.list_pulls_page(token, repo, page).await?;
            summary.pages += 1;
            if items.is_empty() {
                break;
            }
            debug!(page, items = items.len(), "pulls page");

            for item in &items {
                self.store
                    .upsert_pull_request(&item.to_snapshot(project.id, Utc::now()))
                    .await?;
                summary.upserted += 1;
            }
        }
        Ok(summary)
    }
}
