//! Message bus
//!
//! Announces are injected into conversations as inbound system messages;
//! lifecycle events are fanned out to any number of subscribers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::context::PeerKind;
use crate::{Error, Result};

/// A message entering a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub peer_kind: PeerKind,
    /// Sender identifier; system senders use a `system:` prefix
    pub sender_id: String,
    pub user_id: Option<String>,
    pub content: String,
    /// Correlation metadata (task ids, origin ids, trace linkage)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            peer_kind: PeerKind::Direct,
            sender_id: sender_id.into(),
            user_id: None,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle event such as `subagent.started`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub name: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            name: name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Bus used by the orchestrators
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver a message into a conversation
    async fn publish_inbound(&self, message: InboundMessage) -> Result<()>;

    /// Fire-and-forget lifecycle event
    fn broadcast(&self, event: BusEvent);
}

/// In-process bus: inbound messages over an mpsc queue, events over broadcast
pub struct ChannelBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    events_tx: broadcast::Sender<BusEvent>,
}

impl ChannelBus {
    /// Create a bus and the receiver for inbound messages
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (events_tx, _) = broadcast::channel(capacity);
        (
            Self {
                inbound_tx,
                events_tx,
            },
            inbound_rx,
        )
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish_inbound(&self, message: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| Error::Other("Inbound message channel closed".to_string()))
    }

    fn broadcast(&self, event: BusEvent) {
        // No subscribers is not an error
        if self.events_tx.send(event).is_err() {
            debug!("Dropped bus event with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_inbound() {
        let (bus, mut rx) = ChannelBus::new(4);
        let msg = InboundMessage::new("telegram", "42", "system:subagent", "done")
            .with_meta("task_id", "abc");
        bus.publish_inbound(msg.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, msg);
        assert_eq!(received.metadata.get("task_id").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let (bus, _rx) = ChannelBus::new(4);
        let mut sub = bus.subscribe();
        bus.broadcast(BusEvent::new("subagent.started", json!({"id": "t1"})));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.name, "subagent.started");
        assert_eq!(event.payload["id"], "t1");
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped() {
        let (bus, rx) = ChannelBus::new(1);
        drop(rx);
        let result = bus
            .publish_inbound(InboundMessage::new("cli", "1", "system:test", "x"))
            .await;
        assert!(result.is_err());
    }
}
