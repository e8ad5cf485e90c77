//! Process configuration read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `HTTP_ADDR` | `0.0.0.0:8080` |
//! | `DATABASE_PATH` | `repo-mirror.db` |
//! | `GITHUB_WEBHOOK_SECRET` | unset (webhook endpoint answers 503) |
//! | `SYNC_API_TOKEN` | unset (jobs API answers 503) |
//! | `EVENT_BUS` | `inline` (`inline`, `in-process` or `nats`) |
//! | `NATS_URL` | required when `EVENT_BUS=nats` |
//! | `NATS_QUEUE_GROUP` | `repo-mirror-workers` |
//! | `RUN_MODE` | `all` (`all`, `api` or `worker`) |
//! | `WORKER_COUNT` | `1` |
//! | `WORKER_POLL_INTERVAL_MS` | `1000` |
//! | `WORKER_ID` | `hostname:pid` |
//! | `SYNC_JOB_TIMEOUT_SECS` | `600` |
//! | `SYNC_JOB_LEASE_SECS` | `900` |
//! | `GITHUB_API_BASE_URL` | octocrab default |
//! | `RATE_LIMIT_INTERVAL_MS` | `250` |
//! | `RATE_LIMIT_BURST` | `2` |
//!
//! The lease must be longer than the job timeout, and the timeout must be
//! positive, otherwise a running job could be claimed a second time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::github::{DEFAULT_BURST, DEFAULT_INTERVAL};
use crate::types::WorkerId;
use crate::worker::PollConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}: {message}")]
    Invalid {
        key: &'static str,
        value: String,
        message: String,
    },

    #[error("{key} is required when {reason}")]
    Missing {
        key: &'static str,
        reason: &'static str,
    },
}

/// Default NATS queue group shared by worker processes.
pub const DEFAULT_QUEUE_GROUP: &str = "repo-mirror-workers";

/// How verified webhooks reach the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    /// The receiver ingests before answering.
    Inline,
    /// The receiver publishes; a consumer task ingests.
    InProcess,
    /// The receiver publishes to NATS; worker processes ingest from a queue
    /// group.
    Nats,
}

impl FromStr for BusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(BusMode::Inline),
            "in-process" | "inprocess" => Ok(BusMode::InProcess),
            "nats" => Ok(BusMode::Nats),
            other => Err(format!(
                "unknown bus mode {other:?} (expected inline, in-process or nats)"
            )),
        }
    }
}

/// Which parts of the service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// HTTP server, bus consumer and worker pool.
    All,
    /// HTTP server only. Sync jobs are left to worker processes.
    Api,
    /// Bus consumer and worker pool, no HTTP listener.
    Worker,
}

impl RunMode {
    pub fn serves_http(self) -> bool {
        matches!(self, RunMode::All | RunMode::Api)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, RunMode::All | RunMode::Worker)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(RunMode::All),
            "api" => Ok(RunMode::Api),
            "worker" => Ok(RunMode::Worker),
            other => Err(format!("unknown run mode {other:?} (expected all, api or worker)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub database_path: PathBuf,
    pub webhook_secret: Option<Vec<u8>>,
    pub api_token: Option<String>,
    pub bus: BusMode,
    pub nats_url: Option<String>,
    pub nats_queue_group: String,
    pub mode: RunMode,
    pub worker_count: usize,
    pub worker_id: WorkerId,
    pub poll: PollConfig,
    pub github_base_url: Option<String>,
    pub rate_limit_interval: Duration,
    pub rate_limit_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let defaults = PollConfig::new();
        let poll = PollConfig {
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "WORKER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            job_timeout: Duration::from_secs(parse_or(
                &get,
                "SYNC_JOB_TIMEOUT_SECS",
                defaults.job_timeout.as_secs(),
            )?),
            lease: Duration::from_secs(parse_or(
                &get,
                "SYNC_JOB_LEASE_SECS",
                defaults.lease.as_secs(),
            )?),
            ..defaults
        };
        if poll.job_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SYNC_JOB_TIMEOUT_SECS",
                value: "0".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if poll.lease <= poll.job_timeout {
            return Err(ConfigError::Invalid {
                key: "SYNC_JOB_LEASE_SECS",
                value: poll.lease.as_secs().to_string(),
                message: format!(
                    "must exceed SYNC_JOB_TIMEOUT_SECS ({})",
                    poll.job_timeout.as_secs()
                ),
            });
        }

        let bus = parse_or(&get, "EVENT_BUS", BusMode::Inline)?;
        let mode = parse_or(&get, "RUN_MODE", RunMode::All)?;
        let nats_url = get("NATS_URL").map(|url| url.trim().to_string());
        if bus == BusMode::Nats && nats_url.is_none() {
            return Err(ConfigError::Missing {
                key: "NATS_URL",
                reason: "EVENT_BUS=nats",
            });
        }
        if mode == RunMode::Worker && bus == BusMode::InProcess {
            return Err(ConfigError::Invalid {
                key: "EVENT_BUS",
                value: "in-process".to_string(),
                message: "a worker process cannot share an in-process bus".to_string(),
            });
        }

        Ok(Config {
            http_addr: parse_or(&get, "HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("repo-mirror.db")),
            webhook_secret: get("GITHUB_WEBHOOK_SECRET").map(String::into_bytes),
            api_token: get("SYNC_API_TOKEN").map(|token| token.trim().to_string()),
            bus,
            nats_url,
            nats_queue_group: get("NATS_QUEUE_GROUP")
                .map(|group| group.trim().to_string())
                .unwrap_or_else(|| DEFAULT_QUEUE_GROUP.to_string()),
            mode,
            worker_count: parse_or(&get, "WORKER_COUNT", 1usize)?,
            worker_id: get("WORKER_ID")
                .map(WorkerId::new)
                .unwrap_or_else(WorkerId::from_host),
            poll,
            github_base_url: get("GITHUB_API_BASE_URL"),
            rate_limit_interval: Duration::from_millis(parse_or(
                &get,
                "RATE_LIMIT_INTERVAL_MS",
                DEFAULT_INTERVAL.as_millis() as u64,
            )?),
            rate_limit_burst: parse_or(&get, "RATE_LIMIT_BURST", DEFAULT_BURST)?,
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                message: e.to_string(),
                value,
            }),
    }
}
