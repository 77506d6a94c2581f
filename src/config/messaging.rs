//! Broker and consumer configuration types.

use serde::Deserialize;

use crate::bus::topology::DEFAULT_MESSAGE_TTL;

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process broker (no external dependency).
    #[default]
    Memory,
    /// AMQP/RabbitMQ.
    Amqp,
}

/// Broker connection and topology names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP connection URL.
    pub url: String,
    /// Connection pool size (AMQP).
    pub pool_size: usize,
    /// Main direct exchange.
    pub exchange: String,
    /// Main queue.
    pub queue: String,
    /// Routing key binding the main queue to the main exchange.
    pub routing_key: String,
    /// Dead-letter exchange.
    pub dead_letter_exchange: String,
    /// Dead-letter queue. Also used as the dead-letter routing key.
    pub dead_letter_queue: String,
    /// Per-message TTL on the main queue, in milliseconds.
    pub message_ttl_ms: u64,
    /// How long a publish waits for the broker's confirmation.
    pub confirm_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Memory,
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
            exchange: "class.exchange".to_string(),
            queue: "class.queue".to_string(),
            routing_key: "class.routing.key".to_string(),
            dead_letter_exchange: "class.dead-letter.exchange".to_string(),
            dead_letter_queue: "class.dead-letter.queue".to_string(),
            message_ttl_ms: DEFAULT_MESSAGE_TTL.as_millis() as u64,
            confirm_timeout_ms: 5_000,
        }
    }
}

/// Consumer worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Workers kept alive at all times.
    pub concurrency: usize,
    /// Upper bound the pool scales to under backlog.
    pub max_concurrency: usize,
    /// Unacknowledged deliveries per worker.
    pub prefetch: u16,
    /// Extra workers retire after this long without a delivery.
    pub idle_timeout_ms: u64,
    /// How often the pool samples queue depth.
    pub scale_interval_ms: u64,
    /// Map marker strings found in message/name/payload onto test directives.
    pub legacy_markers: bool,
    /// Remembered event keys for redelivery de-duplication.
    pub dedup_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_concurrency: 10,
            prefetch: 1,
            idle_timeout_ms: 60_000,
            scale_interval_ms: 1_000,
            legacy_markers: true,
            dedup_capacity: 10_000,
        }
    }
}
