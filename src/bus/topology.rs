//! Main queue / dead-letter queue wiring.
//!
//! ```text
//!  publisher --(routing_key)--> [exchange] ----> [queue] ----> consumer
//!                                                   |  reject (no requeue)
//!                                                   |  or TTL expiry
//!                                                   v
//!                      [dead_letter_exchange] --(dead_letter_queue)--> [dead_letter_queue]
//! ```
//!
//! Names come from configuration; the shape is fixed.

use std::time::Duration;

use tracing::info;

use super::{BindingSpec, ExchangeSpec, MessageBroker, QueueSpec, Result};
use crate::config::BrokerConfig;

/// Default message TTL on the main queue (5 minutes).
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_millis(300_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub message_ttl: Duration,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            queue: config.queue.clone(),
            routing_key: config.routing_key.clone(),
            dead_letter_exchange: config.dead_letter_exchange.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            message_ttl: Duration::from_millis(config.message_ttl_ms),
        }
    }

    /// Dead-letter routing key. Always the DLQ's own name.
    pub fn dead_letter_routing_key(&self) -> &str {
        &self.dead_letter_queue
    }

    pub fn main_exchange(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange.clone(),
            durable: true,
            auto_delete: false,
        }
    }

    pub fn main_queue(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: true,
            dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
            dead_letter_routing_key: Some(self.dead_letter_routing_key().to_string()),
            message_ttl: Some(self.message_ttl),
        }
    }

    pub fn dead_letter_exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.dead_letter_exchange.clone(),
            durable: true,
            auto_delete: false,
        }
    }

    pub fn dead_letter_queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.dead_letter_queue.clone(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    pub fn bindings(&self) -> [BindingSpec; 2] {
        [
            BindingSpec {
                queue: self.queue.clone(),
                exchange: self.exchange.clone(),
                routing_key: self.routing_key.clone(),
            },
            BindingSpec {
                queue: self.dead_letter_queue.clone(),
                exchange: self.dead_letter_exchange.clone(),
                routing_key: self.dead_letter_routing_key().to_string(),
            },
        ]
    }

    /// Declare exchanges, queues and bindings. Idempotent.
    ///
    /// The dead-letter side is declared first so the main queue never
    /// references a missing exchange.
    pub async fn declare(&self, broker: &dyn MessageBroker) -> Result<()> {
        broker
            .declare_exchange(&self.dead_letter_exchange_spec())
            .await?;
        broker.declare_queue(&self.dead_letter_queue_spec()).await?;
        broker.declare_exchange(&self.main_exchange()).await?;
        broker.declare_queue(&self.main_queue()).await?;

        for binding in self.bindings() {
            broker.bind_queue(&binding).await?;
        }

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            routing_key = %self.routing_key,
            dead_letter_queue = %self.dead_letter_queue,
            ttl_ms = self.message_ttl.as_millis() as u64,
            "Declared broker topology"
        );

        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}
