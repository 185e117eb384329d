//! Publish/subscribe over a partitioned topic, with at-least-once delivery.
//!
//! A [`Subscription`] hands out messages in partition order. Receiving a
//! message does not consume it: the caller acknowledges a [`Receipt`] once it
//! is done with the message, and only acknowledged offsets are ever committed
//! for the consumer group. A consumer that stops without committing sees the
//! unacknowledged messages again on its next subscription.
use async_trait::async_trait;
use rdkafka::error::KafkaError;
use serde::Serialize;
use thiserror::Error;

pub mod kafka;
pub mod memory;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to serialize message: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("message is too large for the broker")]
    MessageTooLarge,
    #[error("timed out waiting for the broker to acknowledge the message")]
    DeliveryTimeout,
    #[error("subscription is closed")]
    Closed,
}

impl ChannelError {
    /// Whether the same operation could succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::Unavailable(_) | ChannelError::Kafka(_) | ChannelError::DeliveryTimeout
        )
    }
}

/// Where a delivered message lives, used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A message handed to a subscriber. The subscriber owns the payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Receipt,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Payload as text, for logs and dead letters.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(self.payload()).into_owned()
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a payload. Returns once the channel durably accepted it.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8])
        -> Result<(), ChannelError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message of the subscribed topic.
    async fn recv(&mut self) -> Result<Delivery, ChannelError>;

    /// Mark a message as fully processed. Its offset becomes eligible for the
    /// next commit.
    fn ack(&mut self, receipt: &Receipt) -> Result<(), ChannelError>;

    /// Commit every acknowledged offset for the consumer group.
    async fn commit(&mut self) -> Result<(), ChannelError>;
}

/// Serialize a value as JSON and publish it.
pub async fn publish_json<P, T>(
    publisher: &P,
    topic: &str,
    key: Option<&str>,
    value: &T,
) -> Result<(), ChannelError>
where
    P: Publisher + ?Sized,
    T: Serialize + Sync,
{
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, key, &payload).await
}
