//! HTTP server.
//!
//! # Endpoints
//!
//! - `POST /webhook` - Accepts GitHub webhook deliveries (returns 200 OK)
//! - `POST /api/v1/projects/{id}/sync` - Queues a full reconciliation (202)
//! - `GET /api/v1/projects/{id}/jobs` - Lists recent sync jobs
//! - `GET /health` - Returns 200 if the server is running
//! - `GET /ready` - Returns 200 if the database answers

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::bus::EventBus;
use crate::ingest::WebhookIngestor;
use crate::store::Store;

pub mod health;
pub mod jobs;
pub mod webhook;

pub use health::{health_handler, ready_handler};
pub use jobs::{jobs_handler, sync_handler};
pub use webhook::webhook_handler;

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Store,
    ingestor: WebhookIngestor,

    /// `None` makes the webhook endpoint answer 503.
    webhook_secret: Option<Vec<u8>>,

    /// Bearer token for the jobs API. `None` makes it answer 503.
    api_token: Option<String>,

    /// When set, deliveries are published instead of ingested inline.
    bus: Option<Arc<dyn EventBus>>,

    /// Detached publishes, drained on shutdown.
    tasks: TaskTracker,
}

impl AppState {
    /// Creates the state. Empty secrets count as unconfigured.
    pub fn new(
        store: Store,
        webhook_secret: Option<Vec<u8>>,
        api_token: Option<String>,
        bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                ingestor: WebhookIngestor::new(store.clone()),
                store,
                webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
                api_token: api_token
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
                bus,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn ingestor(&self) -> &WebhookIngestor {
        &self.inner.ingestor
    }

    pub fn webhook_secret(&self) -> Option<&[u8]> {
        self.inner.webhook_secret.as_deref()
    }

    pub fn api_token(&self) -> Option<&str> {
        self.inner.api_token.as_deref()
    }

    pub fn bus(&self) -> Option<&Arc<dyn EventBus>> {
        self.inner.bus.as_ref()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }

    /// Waits for every detached task spawned so far.
    pub async fn drain_detached(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/api/v1/projects/{id}/sync", post(sync_handler))
        .route("/api/v1/projects/{id}/jobs", get(jobs_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(app_state)
}
