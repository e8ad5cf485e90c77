//! Newtype wrappers for domain identifiers.
//!
//! These keep project, job and delivery identifiers from being mixed up and make
//! signatures self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A tracked project (one external repository).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        ProjectId(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ProjectId)
    }
}

/// A sync job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A GitHub webhook delivery ID (`X-GitHub-Delivery`).
///
/// May be empty when the sender omitted the header; empty IDs are never
/// written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn new(s: impl Into<String>) -> Self {
        DeliveryId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeliveryId {
    fn from(s: String) -> Self {
        DeliveryId(s)
    }
}

/// Identity stamped on claimed jobs (`locked_by`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        WorkerId(s.into())
    }

    /// `hostname:pid`, falling back to `unknown` when the hostname is unavailable.
    pub fn from_host() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        WorkerId(format!("{}:{}", host, std::process::id()))
    }

    /// Derives the identity of the `index`-th worker in a pool.
    pub fn with_suffix(&self, index: usize) -> Self {
        WorkerId(format!("{}#{}", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a repository name is not in `owner/repo` form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository full name: {0:?} (expected owner/repo)")]
pub struct InvalidFullName(pub String);

/// A repository full name (`owner/repo`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoFullName {
    pub owner: String,
    pub repo: String,
}

impl RepoFullName {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoFullName {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parses `owner/repo`, rejecting empty halves and extra segments.
    pub fn parse(s: &str) -> Result<Self, InvalidFullName> {
        let trimmed = s.trim();
        let (owner, repo) = trimmed
            .split_once('/')
            .ok_or_else(|| InvalidFullName(s.to_string()))?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(InvalidFullName(s.to_string()));
        }
        Ok(RepoFullName::new(owner, repo))
    }
}

impl fmt::Display for RepoFullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod repo_full_name {
        use super::*;
        use proptest::prelude::*;

        #[test]
        fn parse_valid() {
            let name = RepoFullName::parse("acme/widgets").unwrap();
            assert_eq!(name.owner, "acme");
            assert_eq!(name.repo, "widgets");
        }

        #[test]
        fn parse_trims_whitespace() {
            let name = RepoFullName::parse("  acme/widgets \n").unwrap();
            assert_eq!(name.to_string(), "acme/widgets");
        }

        #[test]
        fn parse_rejects_malformed() {
            assert!(RepoFullName::parse("").is_err());
            assert!(RepoFullName::parse("acme").is_err());
            assert!(RepoFullName::parse("/widgets").is_err());
            assert!(RepoFullName::parse("acme/").is_err());
            assert!(RepoFullName::parse("acme/widgets/extra").is_err());
        }

        proptest! {
            #[test]
            fn display_parse_roundtrip(
                owner in "[a-zA-Z][a-zA-Z0-9-]{0,38}",
                repo in "[a-zA-Z][a-zA-Z0-9_.-]{0,99}"
            ) {
                let name = RepoFullName::new(&owner, &repo);
                let parsed = RepoFullName::parse(&name.to_string()).unwrap();
                prop_assert_eq!(name, parsed);
            }
        }
    }

    mod delivery_id {
        use super::*;

        #[test]
        fn blank_is_empty() {
            assert!(DeliveryId::new("").is_empty());
            assert!(DeliveryId::new("   ").is_empty());
            assert!(!DeliveryId::new("d-1").is_empty());
        }
    }

    mod project_id {
        use super::*;

        #[test]
        fn parses_uuid() {
            let id = ProjectId::new();
            let parsed: ProjectId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
        }

        #[test]
        fn rejects_garbage() {
            assert!("not-a-uuid".parse::<ProjectId>().is_err());
        }
    }

    mod worker_id {
        use super::*;

        #[test]
        fn suffix_is_distinct_per_index() {
            let base = WorkerId::new("host:1");
            assert_eq!(base.with_suffix(0).as_str(), "host:1#0");
            assert_ne!(base.with_suffix(0), base.with_suffix(1));
        }
    }
}
