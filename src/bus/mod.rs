//! Publish/subscribe channel between the webhook receiver and the ingestor.
//!
//! The bus is an optional accelerator: when it is configured, the receiver
//! publishes and returns immediately, and a consumer task ingests. Messages
//! are JSON-encoded per subject. [`InProcessBus`] serves a single process;
//! [`nats::NatsBus`] lets receivers and workers run as separate processes.
//!
//! Delivery is at-most-once: a publish with no live subscriber, or a
//! subscriber that falls too far behind, drops messages. The periodic sync
//! jobs reconcile whatever is lost.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::warn;

pub mod nats;

pub use nats::NatsBus;

/// Per-subject buffer size.
pub const DEFAULT_SUBJECT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode message for {subject}: {source}")]
    Encode {
        subject: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no subscribers on {0}")]
    NoSubscribers(String),

    #[error("connecting to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("subscribing to {subject}: {message}")]
    Subscribe { subject: String, message: String },

    #[error("publishing on {subject}: {message}")]
    Publish { subject: String, message: String },
}

/// One published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes raw bytes on `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// JSON-encodes `message` and publishes it.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventBus,
    subject: &str,
    message: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(message).map_err(|source| BusError::Encode {
        subject: subject.to_string(),
        source,
    })?;
    bus.publish(subject, payload).await
}

/// An in-process bus over `tokio::sync::broadcast` channels, one per subject.
#[derive(Debug)]
pub struct InProcessBus {
    capacity: usize,
    subjects: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT_CAPACITY)
    }
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subjects: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to `subject`, creating its channel on first use.
    pub fn subscribe(&self, subject: &str) -> broadcast::Receiver<BusMessage> {
        if let Some(sender) = self.sender(subject) {
            return sender.subscribe();
        }
        let mut subjects = self
            .subjects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn sender(&self, subject: &str) -> Option<broadcast::Sender<BusMessage>> {
        self.subjects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(subject)
            .cloned()
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let sender = self
            .sender(subject)
            .ok_or_else(|| BusError::NoSubscribers(subject.to_string()))?;
        sender
            .send(BusMessage {
                subject: subject.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers(subject.to_string()))
    }
}

/// A spawned task nobody waits on in production. Holding it lets tests (and
/// shutdown) wait for completion.
#[derive(Debug)]
pub struct DetachedTask(JoinHandle<()>);

impl DetachedTask {
    /// Spawns `fut` on `tracker` so shutdown can drain it.
    pub fn spawn<F>(tracker: &TaskTracker, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        DetachedTask(tracker.spawn(fut))
    }

    /// Waits for the task. A panic inside it is logged, not propagated.
    pub async fn join(self) {
        if let Err(e) = self.0.await {
            warn!(error = %e, "detached task did not complete");
        }
    }
}
