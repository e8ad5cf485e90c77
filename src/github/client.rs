//! The hosting API seam and its octocrab implementation.
//!
//! `HostingApi` is the narrow set of calls a sync job makes. Each call carries
//! the access token of the project owner, because tokens differ per project.
//! `OctocrabClient` keeps one `Octocrab` instance per token.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use octocrab::Octocrab;
use serde::Serialize;
use tracing::debug;

use super::error::{GitHubApiError, GitHubErrorKind};
use super::models::{RawComment, RawIssue, RawPull};
use crate::types::RepoFullName;

/// Items requested per page.
pub const PER_PAGE: u8 = 100;

/// A user's GitHub access token. Never printed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Calls a sync job makes against the hosting platform.
#[async_trait]
pub trait HostingApi: Send + Sync {
    /// One page (1-based) of issues in any state. Includes pull requests,
    /// which carry a `pull_request` marker.
    async fn list_issues_page(
        &self,
        token: &AccessToken,
        repo: &RepoFullName,
        page: u32,
    ) -> Result<Vec<RawIssue>, GitHubApiError>;

    /// One page (1-based) of pull requests in any state.
    async fn list_pulls_page(
        &self,
        token: &AccessToken,
        repo: &RepoFullName,
        page: u32,
    ) -> Result<Vec<RawPull>, GitHubApiError>;

    /// The first page of comments on an issue.
    async fn list_issue_comments(
        &self,
        token: &AccessToken,
        repo: &RepoFullName,
        number: i64,
    ) -> Result<Vec<RawComment>, GitHubApiError>;
}

#[derive(Serialize)]
struct ListParams {
    state: &'static str,
    per_page: u8,
    page: u32,
}

#[derive(Serialize)]
struct CommentParams {
    per_page: u8,
}

/// Clients kept for reuse. Rotated or revoked tokens age out past this.
const MAX_CACHED_CLIENTS: usize = 64;

/// `HostingApi` over octocrab.
pub struct OctocrabClient {
    /// API root override (GitHub Enterprise, tests). `None` means api.github.com.
    base_uri: Option<String>,
    clients: Mutex<HashMap<AccessToken, Octocrab>>,
}

impl OctocrabClient {
    pub fn new(base_uri: Option<String>) -> Self {
        Self {
            base_uri,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, token: &AccessToken) -> Result<Octocrab, GitHubApiError> {
        let mut clients = self.clients.lock().map_err(|_| {
            GitHubApiError::new(GitHubErrorKind::Permanent, None, "client cache lock poisoned")
        })?;
        if let Some(client) = clients.get(token) {
            return Ok(client.clone());
        }

        let mut builder = Octocrab::builder().personal_token(token.expose().to_string());
        if let Some(base) = &self.base_uri {
            builder = builder
                .base_uri(base.as_str())
                .map_err(|e| GitHubApiError::from_octocrab("configure base URI", e))?;
        }
        let client = builder
            .build()
            .map_err(|e| GitHubApiError::from_octocrab("build client", e))?;
        if clients.len() >= MAX_CACHED_CLIENTS
            && let Some(evicted) = clients.keys().next().cloned()
        {
            clients.remove(&evicted);
        }
        clients.insert(token.clone(), client.clone());
        debug!(cached = clients.len(), "built GitHub client for new token");
        Ok(client)
    }
}

impl fmt::Debug for OctocrabClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OctocrabClient")
            .field("base_uri", &self.base_uri)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HostingApi for OctocrabClient {
    async fn list_issues_page(
        &self,
        token: &AccessToken,
        repo: &RepoFullName,
        page: u32,
    ) -> Result<Vec<RawIssue>, GitHubApiError> {
        let client = self.client_for(token)?;
        let route = format!("/repos/{}/{}/issues", repo.owner, repo.repo);
        let params = ListParams {
            state: "all",
            per_page: PER_PAGE,
            page,
        };
        client
            .get(route, Some(&params))
            .await
            .map_err(|e| GitHubApiError::from_octocrab(&format!("list issues page {page}"), e))
    }

    async fn list_pulls_page(
        &self,
        token: &AccessToken,
        repo: &RepoFullName,
        page: u32,
    ) -> Result<Vec<RawPull>, GitHubApiError> {
        let client = self.client_for(token)?;
        let route = format!("/repos/{}/{}/pulls", repo.owner, repo.repo);
        let params = ListParams {
            state: "all",
            per_page: PER_PAGE,
            page,
        };
        client
            .get(route, Some(&params))
            .await
            .map_err(|e| GitHubApiError::from_octocrab(&format!("list pulls page {page}"), e))
    }

    async fn list_issue_comments(
        &self,
        token: &AccessToken,
        repo: &RepoFullName,
        number: i64,
    ) -> Result<Vec<RawComment>, GitHubApiError> {
        let client = self.client_for(token)?;
        let route = format!("/repos/{}/{}/issues/{}/comments", repo.owner, repo.repo, number);
        client
            .get(route, Some(&CommentParams { per_page: PER_PAGE }))
            .await
            .map_err(|e| GitHubApiError::from_octocrab(&format!("list comments on #{number}"), e))
    }
}
