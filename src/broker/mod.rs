//! Narrow broker capabilities used by the publisher and the consumer.
//!
//! [`memory::MemoryBroker`] implements them in-process; the `kafka`
//! feature adds an `rdkafka`-backed implementation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::{fmt, time::Duration};
use thiserror::Error;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),
    #[error("Broker client error: {0}")]
    Client(String),
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("{0}")]
    Message(String),
}

/// Where a topic should live and how it is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

/// Broker-assigned message time, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    NotAvailable,
    CreateTime(i64),
    LogAppendTime(i64),
}

impl Timestamp {
    pub fn to_millis(self) -> Option<i64> {
        match self {
            Timestamp::NotAvailable => None,
            Timestamp::CreateTime(ms) | Timestamp::LogAppendTime(ms) => Some(ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub position: Position,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Timestamp,
}

/// Broker acknowledgment of a produced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Resolves once the broker acknowledges (or rejects) a sent message. It may
/// also never resolve; callers bound the wait themselves.
pub type AckHandle = BoxFuture<'static, Result<Delivery, BrokerError>>;

#[async_trait]
pub trait Producer: Send + Sync {
    /// Creates the topic. An existing topic is reported as
    /// [`BrokerError::TopicAlreadyExists`].
    async fn create_topic(&self, topic: &TopicSpec) -> Result<(), BrokerError>;

    /// Queues a message for delivery without waiting for it.
    fn send(&self, topic: &str, key: &str, value: &str) -> Result<AckHandle, BrokerError>;

    /// Waits up to `timeout` for queued messages to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Consumer: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Next message, or `None` if nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Option<Result<Message, BrokerError>>;

    /// Marks everything up to and including `position` as processed.
    async fn commit(&mut self, position: &Position) -> Result<(), BrokerError>;

    async fn close(&mut self);
}
