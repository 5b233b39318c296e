use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::WireError;
use crate::message::Message;

/// Publishes messages to subscribers via the PUB/SUB pattern.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message under `topic`. Subscribers filter by topic prefix.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), WireError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), WireError> {
        (**self).publish(topic, message).await
    }
}

/// Receives topic-filtered messages via the PUB/SUB pattern.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to messages with topics matching the given prefix.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), WireError>;

    /// Receive the next `(topic, message)` pair.
    async fn recv(&self) -> Result<(String, Message), WireError>;
}

/// Client side of a request/reply exchange.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send a request and wait for the reply whose `parent_id` matches.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, WireError>;
}
