//! A NATS-backed [`EventBus`].
//!
//! Workers share a queue group, so each published delivery is handled by one
//! of them. Core NATS keeps the at-most-once contract of the in-process bus.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, instrument};

use super::{BusError, BusMessage, EventBus};

/// Client name reported to the server.
const CLIENT_NAME: &str = "repo-mirror";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .name(CLIENT_NAME)
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        info!("connected to NATS");
        Ok(NatsBus { client })
    }

    /// Joins `group` on `subject`. Dropping the stream unsubscribes.
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;
        debug!(subject, group, "joined queue group");
        Ok(subscriber
            .map(|msg| BusMessage {
                subject: msg.subject.to_string(),
                payload: msg.payload.to_vec(),
            })
            .boxed())
    }

    /// Sends anything still buffered in the client.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(|e| BusError::Publish {
            subject: "*".to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }
}
