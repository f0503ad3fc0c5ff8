//! In-memory implementation of the EventBus trait for tests and local development

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::{BusError, BusMessage, BusResult, EventBus};

/// EventBus backed by a tokio broadcast channel.
///
/// Every subscriber sees every message whose subject matches its pattern.
/// The bus also keeps a log of accepted messages so tests can assert on what
/// the relay published, and can be switched offline to simulate a broker
/// outage.
///
/// ```rust
/// use event_bus::{BusMessage, EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe("smoke-test.events.>").await?;
///
/// bus.publish(BusMessage::new("smoke-test.events.thing.created".into(), b"{}".to_vec())).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "smoke-test.events.thing.created");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    published: Arc<Mutex<Vec<BusMessage>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryBus {
    /// Bus with a 1000-message buffer per subscriber.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Lagging subscribers lose the oldest messages beyond `buffer_size`.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            published: Arc::new(Mutex::new(Vec::new())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reject every publish with a connection error while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Messages accepted on subjects matching `pattern`.
    pub fn published_matching(&self, pattern: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|msg| matches_pattern(&msg.subject, pattern))
            .collect()
    }
}

/// NATS-style subject matching: `*` matches one token, `>` the rest.
pub(crate) fn matches_pattern(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        match pattern_tokens[p_idx] {
            ">" => return true,
            "*" => {}
            token if token == subject_tokens[s_idx] => {}
            _ => return false,
        }
        s_idx += 1;
        p_idx += 1;
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError("in-memory bus is offline".to_string()));
        }

        if let Ok(mut log) = self.published.lock() {
            log.push(message.clone());
        }

        // No receivers is fine
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(pattern = %pattern, skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(subject: &str, payload: &[u8]) -> BusMessage {
        BusMessage::new(subject.to_string(), payload.to_vec())
    }

    async fn next(stream: &mut BoxStream<'static, BusMessage>) -> BusMessage {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("smoke.events.thing.created", "smoke.events.thing.created"));
        assert!(matches_pattern("smoke.events.thing.created", "smoke.*.thing.created"));
        assert!(!matches_pattern("smoke.events.thing.created", "smoke.*.created"));
        assert!(matches_pattern("smoke.events.thing.created", "smoke.events.>"));
        assert!(!matches_pattern("smoke.events.thing.created", "billing.>"));
        assert!(matches_pattern("single", "*"));
        assert!(!matches_pattern("one.two", "one"));
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_in_order() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("test.>").await.unwrap();

        for i in 0..3 {
            bus.publish(msg(&format!("test.msg.{i}"), format!("m{i}").as_bytes()))
                .await
                .unwrap();
        }

        for i in 0..3 {
            let received = next(&mut stream).await;
            assert_eq!(received.subject, format!("test.msg.{i}"));
        }
        assert_eq!(bus.published().len(), 3);
    }

    #[tokio::test]
    async fn test_headers_survive_transport() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("a.>").await.unwrap();

        let mut headers = std::collections::HashMap::new();
        headers.insert("trace-id".to_string(), "t-1".to_string());
        bus.publish(msg("a.b", b"x").with_headers(headers)).await.unwrap();

        let received = next(&mut stream).await;
        assert_eq!(received.header("trace-id"), Some("t-1"));
    }

    #[tokio::test]
    async fn test_offline_bus_rejects_publish() {
        let bus = InMemoryBus::new();
        bus.set_offline(true);
        let err = bus.publish(msg("a.b", b"x")).await.unwrap_err();
        assert!(matches!(err, BusError::ConnectionError(_)));
        assert!(bus.published().is_empty());

        bus.set_offline(false);
        bus.publish(msg("a.b", b"x")).await.unwrap();
        assert_eq!(bus.published_matching("a.*").len(), 1);
        assert!(bus.published_matching("c.>").is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_filtering() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("smoke.events.*").await.unwrap();

        bus.publish(msg("smoke.events.created", b"1")).await.unwrap();
        bus.publish(msg("smoke.events.thing.created", b"2")).await.unwrap();
        bus.publish(msg("other.events.created", b"3")).await.unwrap();

        assert_eq!(next(&mut stream).await.payload, b"1");
        let nothing = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(nothing.is_err(), "no further messages should match");
    }
}
