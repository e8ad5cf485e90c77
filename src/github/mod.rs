//! GitHub REST access for bulk reconciliation.
//!
//! - `client`: the `HostingApi` trait and its octocrab implementation
//! - `credentials`: per-project access token lookup
//! - `error`: transient / permanent error classification
//! - `models`: wire shapes of issues, pull requests and comments
//! - `rate_limit`: token bucket shared by all outbound calls

mod client;
mod credentials;
mod error;
pub mod models;
mod rate_limit;

pub use client::{AccessToken, HostingApi, OctocrabClient, PER_PAGE};
pub use credentials::{CredentialError, CredentialProvider, LinkedAccountCredentials};
pub use error::{GitHubApiError, GitHubErrorKind};
pub use models::{LabelRef, RawComment, RawIssue, RawPull, UserRef};
pub use rate_limit::{DEFAULT_BURST, DEFAULT_INTERVAL, RateLimitError, RateLimiter};
