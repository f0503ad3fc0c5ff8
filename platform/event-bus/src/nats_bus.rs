//! NATS-backed implementation of the EventBus trait

use std::collections::HashMap;

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use crate::{BusError, BusMessage, BusResult, EventBus};

/// Production bus wrapping an `async_nats::Client`.
///
/// Headers are forwarded as NATS headers; `Nats-Msg-Id` carries the event id
/// so a JetStream stream with a duplicate window drops broker-level replays.
///
/// ```rust,no_run
/// use event_bus::{BusMessage, EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::new(async_nats::connect("nats://localhost:4222").await?);
/// bus.publish(BusMessage::new("smoke-test.events.thing.created".into(), b"{}".to_vec())).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to `url` and wrap the client.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        tracing::info!(url = %url, "connected to NATS");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn to_nats_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        map.insert(key.as_str(), value.as_str());
    }
    map
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        let subject = message.subject;
        let payload = message.payload.into();

        let result = match message.headers.as_ref().filter(|h| !h.is_empty()) {
            Some(headers) => {
                self.client
                    .publish_with_headers(subject, to_nats_headers(headers), payload)
                    .await
            }
            None => self.client.publish(subject, payload).await,
        };
        result.map_err(|e| BusError::PublishError(e.to_string()))?;

        // Flush so that a publish acknowledged here has reached the server.
        self.client
            .flush()
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(reply) = nats_msg.reply {
                msg = msg.with_reply_to(reply.to_string());
            }

            if let Some(nats_headers) = nats_msg.headers {
                let headers: HashMap<String, String> = nats_headers
                    .iter()
                    .filter_map(|(key, values)| {
                        values.first().map(|v| (key.to_string(), v.to_string()))
                    })
                    .collect();
                if !headers.is_empty() {
                    msg = msg.with_headers(headers);
                }
            }

            msg
        });

        Ok(stream.boxed())
    }
}
