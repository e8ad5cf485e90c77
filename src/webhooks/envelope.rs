//! Minimal, tolerant view of a webhook payload, and the message handed from
//! the receiver to the ingestor.
//!
//! Only the fields ingestion needs are extracted. Each field is decoded on its
//! own, so a malformed `issue` object does not hide the repository name, and
//! a body that is not JSON at all yields an empty envelope rather than an
//! error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::github::{RawIssue, RawPull};
use crate::types::DeliveryId;

/// Bus subject for received deliveries.
pub const SUBJECT_WEBHOOK_RECEIVED: &str = "github.webhook.received";

/// The fields of a delivery that ingestion looks at. All optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialEnvelope {
    pub action: Option<String>,
    pub repo_full_name: Option<String>,
    pub issue: Option<RawIssue>,
    pub pull_request: Option<RawPull>,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Objects without a real id and number cannot be keyed and are dropped.
fn identified(id: i64, number: i64) -> bool {
    id > 0 && number > 0
}

impl PartialEnvelope {
    /// Extracts what it can from `body`. Never fails.
    pub fn parse(body: &[u8]) -> Self {
        let root: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "webhook body is not JSON; using empty envelope");
                return Self::default();
            }
        };

        let action = non_empty(root.get("action").and_then(Value::as_str));
        let repo_full_name = non_empty(
            root.get("repository")
                .and_then(|r| r.get("full_name"))
                .and_then(Value::as_str),
        );
        let issue = root
            .get("issue")
            .filter(|v| v.is_object())
            .and_then(|v| RawIssue::deserialize(v).ok())
            .filter(|i| identified(i.id, i.number));
        let pull_request = root
            .get("pull_request")
            .filter(|v| v.is_object())
            .and_then(|v| RawPull::deserialize(v).ok())
            .filter(|p| identified(p.id, p.number));

        PartialEnvelope {
            action,
            repo_full_name,
            issue,
            pull_request,
        }
    }
}

/// A verified delivery on its way to the ingestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookReceived {
    pub delivery_id: DeliveryId,
    /// `X-GitHub-Event`, possibly empty.
    pub event: String,
    /// Envelope `action`, empty when absent.
    pub action: String,
    /// Envelope `repository.full_name`, empty when absent.
    pub repo_full_name: String,
    /// The raw body, exactly as signed.
    pub payload: String,
}

impl WebhookReceived {
    /// Builds the message from the request parts. Non-UTF-8 bodies are
    /// stored lossily; they cannot carry a usable envelope anyway.
    pub fn from_request(
        delivery_id: DeliveryId,
        event: impl Into<String>,
        envelope: &PartialEnvelope,
        body: &[u8],
    ) -> Self {
        WebhookReceived {
            delivery_id,
            event: event.into(),
            action: envelope.action.clone().unwrap_or_default(),
            repo_full_name: envelope.repo_full_name.clone().unwrap_or_default(),
            payload: String::from_utf8_lossy(body).into_owned(),
        }
    }
}
