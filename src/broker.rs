//! Event-broker publisher seam.
//!
//! The wire protocol is out of scope; the engine only depends on
//! [`EventPublisher`]. The in-process broker backs tests, the WebSocket feed
//! and the background consumers, and preserves per-aggregate order because
//! the forwarder publishes one event at a time.

use crate::events::DomainEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A published record. `partition_key` is the aggregate id so that downstream
/// partitioning preserves per-aggregate order; `event_id` is stable for
/// consumer-side deduplication.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition_key: String,
    pub event_id: Uuid,
    pub event: DomainEvent,
}

impl BrokerMessage {
    pub fn from_event(event: DomainEvent, topic_prefix: &str) -> Self {
        Self {
            topic: event.topic(topic_prefix),
            partition_key: event.aggregate_id.clone(),
            event_id: event.id,
            event,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: BrokerMessage) -> Result<(), PublishError>;
}

/// Single-process broker on a broadcast channel. Consumers filter by topic;
/// slow consumers may observe `Lagged` and must tolerate missed messages the
/// same way they tolerate broker retention limits.
pub struct InMemoryBroker {
    sender: broadcast::Sender<BrokerMessage>,
    published: AtomicU64,
}

impl InMemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, published: AtomicU64::new(0) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerMessage> {
        self.sender.subscribe()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), PublishError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine; the broker is not required to retain.
        let _ = self.sender.send(message);
        Ok(())
    }
}
