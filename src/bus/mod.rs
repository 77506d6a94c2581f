//! Message broker abstraction.
//!
//! This module contains:
//! - `MessageBroker` trait: declare topology, submit and confirm publishes, consume
//! - `Delivery`: one message handed to one consumer, settled by ack or reject
//! - `Topology`: the main queue / dead-letter queue wiring
//! - Implementations: in-memory, AMQP (RabbitMQ)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{BrokerConfig, BrokerType};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod topology;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;
pub use topology::Topology;

/// Content type of every published body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("Queue '{0}' not declared")]
    UnknownQueue(String),
}

/// Durable direct exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Queue declaration with optional dead-lettering and TTL arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
}

/// Binding of a queue to an exchange under an exact routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Broker answer to a confirmed, mandatory publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Accepted and routed to at least one queue.
    Acked,
    /// Refused by the broker.
    Nacked,
    /// Accepted but no binding matched; the broker returned it.
    Returned,
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    Rejected,
    Expired,
    Other(String),
}

impl DeathReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "rejected" => DeathReason::Rejected,
            "expired" => DeathReason::Expired,
            other => DeathReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::Other(other) => other,
        }
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the broker-owned dead-letter history (`x-death`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub reason: DeathReason,
    /// Queue the message was dead-lettered from.
    pub queue: String,
    pub count: u64,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to exactly one consumer.
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub deaths: Vec<DeathRecord>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        deaths: Vec<DeathRecord>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            deaths,
            acker,
        }
    }

    /// Remove the message from its queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message. Without requeue the broker dead-letters it.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    /// Most recent dead-letter entry, if the message has been dead-lettered.
    pub fn last_death(&self) -> Option<&DeathRecord> {
        self.deaths.first()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("deaths", &self.deaths)
            .field("bytes", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Outstanding publisher confirmation of a submitted message.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation>>;

/// Interface to the message broker.
///
/// Implementations:
/// - `InMemoryBroker`: in-process, enforces TTL and dead-lettering itself
/// - `AmqpBroker`: RabbitMQ via AMQP 0-9-1
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a direct exchange. Redeclaring with the same shape is a no-op.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue. Redeclaring with different arguments fails.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()>;

    /// Hand a persistent, mandatory message to the broker. Returns once the
    /// broker has taken the message; the returned future resolves with its
    /// confirmation.
    async fn submit(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<PendingConfirm>;

    /// Submit and wait for the broker's confirmation.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Confirmation> {
        self.submit(exchange, routing_key, body).await?.await
    }

    /// Start a consumer on `queue`. Each call yields an independent consumer
    /// competing for the same messages.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Number of messages ready for delivery.
    async fn queue_depth(&self, queue: &str) -> Result<u32>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker based on configuration.
///
/// Requires the corresponding feature for external brokers:
/// - AMQP: `--features amqp`
pub async fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn MessageBroker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Memory => {
            info!(broker_type = "memory", "Message broker initialized");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::connect(&config.url, config.pool_size).await?;
                info!(broker_type = "amqp", "Message broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_death_reason_parse() {
        assert_eq!(DeathReason::parse("rejected"), DeathReason::Rejected);
        assert_eq!(DeathReason::parse("expired"), DeathReason::Expired);
        assert_eq!(
            DeathReason::parse("maxlen"),
            DeathReason::Other("maxlen".to_string())
        );
        assert_eq!(DeathReason::Expired.to_string(), "expired");
    }

    #[tokio::test]
    async fn test_init_memory_broker() {
        let config = BrokerConfig::default();
        assert!(init_broker(&config).await.is_ok());
    }

    #[cfg(not(feature = "amqp"))]
    #[tokio::test]
    async fn test_init_amqp_without_feature_fails() {
        let config = BrokerConfig {
            broker_type: BrokerType::Amqp,
            ..Default::default()
        };
        assert!(init_broker(&config).await.is_err());
    }
}
