//! GitHub API error types.
//!
//! Errors are classified as transient or permanent so that a failed sync job
//! records which of the two it was:
//!
//! - **Transient**: 5xx, 429, 403 rate limiting, network failures. A later
//!   reconciling pass is likely to succeed.
//! - **Permanent**: other 4xx (bad credentials, repository gone or private),
//!   undecodable responses.

use std::fmt;
use thiserror::Error;

/// The kind of GitHub API error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubErrorKind {
    /// Likely to clear up without intervention.
    Transient,

    /// Needs a change on our side or the repository's (credentials, access).
    Permanent,
}

impl GitHubErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitHubErrorKind::Transient => "transient",
            GitHubErrorKind::Permanent => "permanent",
        }
    }
}

/// A GitHub API error with its classification.
#[derive(Debug, Error)]
pub struct GitHubApiError {
    pub kind: GitHubErrorKind,

    /// The HTTP status code, if the request got a response.
    pub status_code: Option<u16>,

    /// What we were doing, followed by the underlying message.
    pub message: String,

    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for GitHubApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(
                f,
                "{} GitHub API error (HTTP {}): {}",
                self.kind.as_str(),
                code,
                self.message
            ),
            None => write!(f, "{} GitHub API error: {}", self.kind.as_str(), self.message),
        }
    }
}

impl GitHubApiError {
    /// Creates an error that did not come from octocrab (test doubles, setup).
    pub fn new(kind: GitHubErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
            source: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == GitHubErrorKind::Transient
    }

    /// Classifies an octocrab error raised while performing `context`.
    pub fn from_octocrab(context: &str, err: octocrab::Error) -> Self {
        let status_code = extract_status_code(&err);
        let detail = err.to_string();
        let kind = classify(status_code, &detail);
        Self {
            kind,
            status_code,
            message: format!("{context}: {detail}"),
            source: Some(err),
        }
    }
}

/// Classifies from the status code, falling back to the message text when
/// the request never produced a response.
fn classify(status_code: Option<u16>, message: &str) -> GitHubErrorKind {
    match status_code {
        Some(429) => GitHubErrorKind::Transient,
        Some(403) if is_rate_limit_error(message) => GitHubErrorKind::Transient,
        Some(code) if (500..600).contains(&code) => GitHubErrorKind::Transient,
        Some(_) => GitHubErrorKind::Permanent,
        None if is_network_error(message) => GitHubErrorKind::Transient,
        None => GitHubErrorKind::Permanent,
    }
}

fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    match err {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

fn is_rate_limit_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("rate limit")
        || message_lower.contains("api rate")
        || message_lower.contains("secondary rate")
        || message_lower.contains("abuse detection")
}

fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("connection")
        || message_lower.contains("network")
        || message_lower.contains("dns")
        || message_lower.contains("timed out")
}
