//! AMQP (RabbitMQ) broker implementation.
//!
//! Topology arguments map onto the RabbitMQ queue arguments
//! `x-dead-letter-exchange`, `x-dead-letter-routing-key` and `x-message-ttl`;
//! the broker itself performs dead-lettering and expiry.

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as AmqpConfirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    Acknowledger, BindingSpec, BusError, Confirmation, DeathReason, DeathRecord, Delivery,
    DeliveryStream, ExchangeSpec, MessageBroker, PendingConfirm, QueueSpec, Result,
    CONTENT_TYPE_JSON,
};

const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
const X_MESSAGE_TTL: &str = "x-message-ttl";
const X_DEATH: &str = "x-death";

/// RabbitMQ broker over a pooled connection.
///
/// Publishing reuses one confirm-mode channel; every consumer gets its own
/// channel so prefetch and acknowledgements stay per worker.
pub struct AmqpBroker {
    pool: Pool,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    /// Connect and verify the broker is reachable.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %url, "Connected to AMQP");

        Ok(Self {
            pool,
            publish_channel: Mutex::new(None),
        })
    }

    /// Get a fresh channel from the pool.
    async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Confirm-mode channel for publishing, recreated when it has closed.
    async fn publisher_channel(&self) -> Result<Channel> {
        let mut slot = self.publish_channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    fn queue_arguments(spec: &QueueSpec) -> Result<FieldTable> {
        let mut args = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            args.insert(
                ShortString::from(X_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        if let Some(key) = &spec.dead_letter_routing_key {
            args.insert(
                ShortString::from(X_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }
        if let Some(ttl) = spec.message_ttl {
            let millis = i32::try_from(ttl.as_millis()).map_err(|_| {
                BusError::Declare(format!(
                    "message TTL {:?} of queue '{}' exceeds the {} ms AMQP limit",
                    ttl,
                    spec.name,
                    i32::MAX
                ))
            })?;
            args.insert(ShortString::from(X_MESSAGE_TTL), AMQPValue::LongInt(millis));
        }
        Ok(args)
    }

    fn long_string(value: &AMQPValue) -> Option<String> {
        match value {
            AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_string),
            AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
            _ => None,
        }
    }

    fn integer(value: &AMQPValue) -> Option<u64> {
        match value {
            AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
            AMQPValue::LongUInt(n) => Some(u64::from(*n)),
            AMQPValue::Timestamp(n) => Some(*n),
            _ => None,
        }
    }

    /// Parse the broker-maintained `x-death` history, newest first.
    fn deaths(properties: &BasicProperties) -> Vec<DeathRecord> {
        let Some(headers) = properties.headers() else {
            return Vec::new();
        };
        let Some(AMQPValue::FieldArray(entries)) = headers.inner().get(X_DEATH) else {
            return Vec::new();
        };

        entries
            .as_slice()
            .iter()
            .filter_map(|entry| match entry {
                AMQPValue::FieldTable(table) => {
                    let fields = table.inner();
                    Some(DeathRecord {
                        reason: fields
                            .get("reason")
                            .and_then(Self::long_string)
                            .map(|r| DeathReason::parse(&r))
                            .unwrap_or_else(|| DeathReason::Other("unknown".to_string())),
                        queue: fields
                            .get("queue")
                            .and_then(Self::long_string)
                            .unwrap_or_default(),
                        count: fields.get("count").and_then(Self::integer).unwrap_or(1),
                    })
                }
                _ => None,
            })
            .collect()
    }

    fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
        let deaths = Self::deaths(&delivery.properties);
        Delivery::new(
            delivery.data,
            delivery.routing_key.as_str(),
            delivery.redelivered,
            deaths,
            Box::new(AmqpAcker {
                acker: delivery.acker,
            }),
        )
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                &spec.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare exchange: {}", e)))?;

        debug!(exchange = %spec.name, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                Self::queue_arguments(spec)?,
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare queue: {}", e)))?;

        debug!(queue = %spec.name, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn submit(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<PendingConfirm> {
        let channel = self.publisher_channel().await?;

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        Ok(Box::pin(async move {
            let confirmation = confirm
                .await
                .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

            Ok(match confirmation {
                AmqpConfirmation::Ack(Some(_returned)) => Confirmation::Returned,
                AmqpConfirmation::Ack(None) => Confirmation::Acked,
                AmqpConfirmation::Nack(_) => Confirmation::Nacked,
                AmqpConfirmation::NotRequested => {
                    error!("Publisher confirms not enabled on channel");
                    Confirmation::Nacked
                }
            })
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        let channel = self.channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "AMQP consumer started");

        let stream = consumer.map(|delivery| {
            delivery
                .map(Self::into_delivery)
                .map_err(|e| BusError::Consume(format!("Consumer delivery error: {}", e)))
        });
        Ok(Box::pin(stream))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| match e {
                lapin::Error::ProtocolError(_) => BusError::UnknownQueue(queue.to_string()),
                other => BusError::Consume(format!("Failed to inspect queue: {}", other)),
            })?;
        Ok(declared.message_count())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to reject: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topology;
    use lapin::types::FieldArray;
    use std::time::Duration;

    #[test]
    fn test_main_queue_arguments() {
        let args = AmqpBroker::queue_arguments(&Topology::default().main_queue()).unwrap();
        let inner = args.inner();

        assert_eq!(
            inner.get(X_DEAD_LETTER_EXCHANGE).and_then(AmqpBroker::long_string),
            Some("class.dead-letter.exchange".to_string())
        );
        assert_eq!(
            inner.get(X_DEAD_LETTER_ROUTING_KEY).and_then(AmqpBroker::long_string),
            Some("class.dead-letter.queue".to_string())
        );
        assert_eq!(inner.get(X_MESSAGE_TTL), Some(&AMQPValue::LongInt(300_000)));
    }

    #[test]
    fn test_dlq_queue_has_no_arguments() {
        let args = AmqpBroker::queue_arguments(&Topology::default().dead_letter_queue_spec()).unwrap();
        assert!(args.inner().is_empty());
    }

    #[test]
    fn test_custom_ttl_argument() {
        let mut spec = Topology::default().main_queue();
        spec.message_ttl = Some(Duration::from_secs(10));
        let args = AmqpBroker::queue_arguments(&spec).unwrap();
        assert_eq!(args.inner().get(X_MESSAGE_TTL), Some(&AMQPValue::LongInt(10_000)));
    }

    #[test]
    fn test_ttl_beyond_long_int_is_rejected() {
        let mut spec = Topology::default().main_queue();
        spec.message_ttl = Some(Duration::from_millis(i32::MAX as u64));
        let args = AmqpBroker::queue_arguments(&spec).unwrap();
        assert_eq!(args.inner().get(X_MESSAGE_TTL), Some(&AMQPValue::LongInt(i32::MAX)));

        spec.message_ttl = Some(Duration::from_millis(i32::MAX as u64 + 1));
        assert!(matches!(
            AmqpBroker::queue_arguments(&spec),
            Err(BusError::Declare(_))
        ));
    }

    #[test]
    fn test_parse_x_death_header() {
        let mut death = FieldTable::default();
        death.insert("reason".into(), AMQPValue::LongString("expired".into()));
        death.insert("queue".into(), AMQPValue::LongString("class.queue".into()));
        death.insert("count".into(), AMQPValue::LongLongInt(2));

        let mut headers = FieldTable::default();
        headers.insert(
            X_DEATH.into(),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
        );
        let properties = BasicProperties::default().with_headers(headers);

        let deaths = AmqpBroker::deaths(&properties);
        assert_eq!(
            deaths,
            vec![DeathRecord {
                reason: DeathReason::Expired,
                queue: "class.queue".to_string(),
                count: 2,
            }]
        );
    }

    #[test]
    fn test_no_headers_no_deaths() {
        assert!(AmqpBroker::deaths(&BasicProperties::default()).is_empty());
    }
}
