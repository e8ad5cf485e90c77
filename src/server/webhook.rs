//! Webhook endpoint handler.
//!
//! Verifies the delivery signature, extracts the minimal envelope and hands
//! the delivery on: published to the bus when one is configured, ingested
//! inline otherwise. Always answers quickly and makes no outbound calls.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::bus::{DetachedTask, EventBus, publish_json};
use crate::types::DeliveryId;
use crate::webhooks::{PartialEnvelope, SUBJECT_WEBHOOK_RECEIVED, SignatureError, WebhookReceived, verify};

/// Header name for GitHub event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for GitHub delivery ID.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for GitHub signature.
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors returned to the webhook sender.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook secret not configured")]
    SecretNotConfigured,

    #[error("request body is empty")]
    EmptyBody,

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
}

impl WebhookError {
    fn code(&self) -> &'static str {
        match self {
            WebhookError::SecretNotConfigured => "webhook_secret_not_configured",
            WebhookError::EmptyBody => "empty_body",
            WebhookError::InvalidSignature(_) => "invalid_signature",
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::SecretNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::EmptyBody => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
        };
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}

/// Webhook handler.
///
/// # Response
///
/// - 200 OK: delivery accepted (published or ingested)
/// - 400 Bad Request: empty body
/// - 401 Unauthorized: missing, malformed or mismatching signature
/// - 503 Service Unavailable: no webhook secret configured
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let event = header_value(&headers, HEADER_EVENT);
    let delivery_id = DeliveryId::new(header_value(&headers, HEADER_DELIVERY));

    let Some(secret) = app_state.webhook_secret() else {
        error!(delivery_id = %delivery_id, event = %event, "webhook secret not configured; rejecting");
        return Err(WebhookError::SecretNotConfigured);
    };

    if body.is_empty() {
        warn!(delivery_id = %delivery_id, "empty webhook body");
        return Err(WebhookError::EmptyBody);
    }

    // Verify before parsing anything from the body.
    let signature = headers.get(HEADER_SIGNATURE).and_then(|v| v.to_str().ok());
    if let Err(e) = verify(&body, signature, secret) {
        warn!(delivery_id = %delivery_id, event = %event, reason = %e, "webhook signature rejected");
        return Err(e.into());
    }

    let envelope = PartialEnvelope::parse(&body);
    let msg = WebhookReceived::from_request(delivery_id, event, &envelope, &body);
    debug!(
        delivery_id = %msg.delivery_id,
        event = %msg.event,
        action = %msg.action,
        repo = %msg.repo_full_name,
        "webhook verified"
    );

    match app_state.bus() {
        Some(bus) => {
            // Detached: the sender gets its answer without waiting on the bus.
            let _task = publish_detached(bus.clone(), app_state.tasks(), msg);
        }
        None => {
            let report = app_state.ingestor().ingest(&msg).await;
            debug!(?report, "ingested inline");
        }
    }

    Ok(StatusCode::OK)
}

/// Publishes `msg` on a tracked background task. Failures are logged only.
pub fn publish_detached(
    bus: Arc<dyn EventBus>,
    tasks: &TaskTracker,
    msg: WebhookReceived,
) -> DetachedTask {
    DetachedTask::spawn(tasks, async move {
        match publish_json(bus.as_ref(), SUBJECT_WEBHOOK_RECEIVED, &msg).await {
            Ok(()) => info!(delivery_id = %msg.delivery_id, "published webhook"),
            Err(e) => error!(delivery_id = %msg.delivery_id, error = %e, "failed to publish webhook"),
        }
    })
}

/// Reads an optional header, trimmed. Missing or non-UTF-8 values are empty.
fn header_value(headers: &HeaderMap, name: &'static str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
