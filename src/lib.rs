//! Repo Mirror - keeps a local snapshot of GitHub issues and pull requests.
//!
//! Webhook deliveries update the snapshot as they arrive; a durable job queue
//! drives rate-limited bulk reconciliation against the REST API.

pub mod bus;
pub mod config;
pub mod github;
pub mod ingest;
pub mod server;
pub mod store;
pub mod types;
pub mod webhooks;
pub mod worker;
