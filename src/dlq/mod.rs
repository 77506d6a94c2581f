//! Dead-letter queue sink.
//!
//! Consumes the dead-letter queue, logs every message at error level, hands
//! it to a `DeadLetterRecorder` and acknowledges it. Nothing is ever moved
//! back to the main queue.
//!
//! ## Recorders
//!
//! - `NoopDeadLetterRecorder`: logging only
//! - `ChannelDeadLetterRecorder`: forwards to an mpsc channel (tests, tooling)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, DeathReason, Delivery, MessageBroker};
use crate::event::Event;

/// Errors that can occur while recording a dead letter.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Recorder closed")]
    Closed,

    #[error("Failed to record dead letter: {0}")]
    RecordFailed(String),
}

/// One message taken off the dead-letter queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Decoded event, if the body was a valid one.
    pub event: Option<Event>,
    /// Body as received, lossily decoded.
    pub raw_body: String,
    /// Why the broker dead-lettered it (`rejected`, `expired`, ...).
    pub reason: Option<DeathReason>,
    /// Queue the message was dead-lettered from.
    pub source_queue: Option<String>,
    /// How many times it was dead-lettered from that queue.
    pub count: u64,
    pub received_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let death = delivery.last_death();
        Self {
            event: Event::from_json(&delivery.body).ok(),
            raw_body: String::from_utf8_lossy(&delivery.body).into_owned(),
            reason: death.map(|d| d.reason.clone()),
            source_queue: death.map(|d| d.queue.clone()),
            count: death.map(|d| d.count).unwrap_or(0),
            received_at: Utc::now(),
        }
    }

    pub fn entity_id(&self) -> Option<i64> {
        self.event.as_ref().and_then(|e| e.entity_id)
    }
}

/// Destination for dead letters (alerting, audit store, test channel).
#[async_trait]
pub trait DeadLetterRecorder: Send + Sync {
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;
}

/// Recorder that does nothing beyond the sink's own logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDeadLetterRecorder;

#[async_trait]
impl DeadLetterRecorder for NoopDeadLetterRecorder {
    async fn record(&self, _dead_letter: DeadLetter) -> Result<(), DlqError> {
        Ok(())
    }
}

/// Recorder that forwards dead letters to a channel.
pub struct ChannelDeadLetterRecorder {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterRecorder {
    /// Create a new channel recorder.
    ///
    /// Returns the recorder and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterRecorder for ChannelDeadLetterRecorder {
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        self.sender.send(dead_letter).map_err(|_| DlqError::Closed)
    }
}

/// Consumer bound to the dead-letter queue.
pub struct DeadLetterSink {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    recorder: Arc<dyn DeadLetterRecorder>,
}

impl DeadLetterSink {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        recorder: Arc<dyn DeadLetterRecorder>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            recorder,
        }
    }

    /// Log, record and acknowledge one dead letter.
    pub async fn handle(&self, delivery: Delivery) -> DeadLetter {
        let dead_letter = DeadLetter::from_delivery(&delivery);

        error!(
            queue = %self.queue,
            entity_id = ?dead_letter.entity_id(),
            reason = %dead_letter.reason.as_ref().map(DeathReason::as_str).unwrap_or("unknown"),
            source_queue = %dead_letter.source_queue.as_deref().unwrap_or("unknown"),
            count = dead_letter.count,
            body = %dead_letter.raw_body,
            "Message dead-lettered"
        );

        if let Err(e) = self.recorder.record(dead_letter.clone()).await {
            warn!(queue = %self.queue, error = %e, "Failed to record dead letter");
        }
        if let Err(e) = delivery.ack().await {
            warn!(queue = %self.queue, error = %e, "Failed to acknowledge dead letter");
        }

        dead_letter
    }

    /// Consume until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BusError> {
        let mut stream = self.broker.consume(&self.queue, "dead-letter-sink", 1).await?;
        info!(queue = %self.queue, "Dead-letter sink started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        self.handle(delivery).await;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!(queue = %self.queue, "Dead-letter stream ended");
                        break;
                    }
                }
            }
        }

        info!(queue = %self.queue, "Dead-letter sink stopped");
        Ok(())
    }
}
