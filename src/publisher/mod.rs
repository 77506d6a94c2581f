//! Event publisher.
//!
//! Serializes class events and publishes them to the main exchange with
//! publisher confirms and the mandatory flag set. An unroutable publish is a
//! warning, not an error; a negative or missing confirmation is a delivery
//! failure that is logged and returned, never retried here.
//!
//! Notifications only wait for the broker to take the message. Their
//! confirmations settle in tasks tracked by the publisher and collected with
//! [`EventPublisher::drain`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn, Instrument, Span};

use crate::bus::{BusError, Confirmation, MessageBroker, PendingConfirm, Topology};
use crate::config::BrokerConfig;
use crate::event::{Action, Event};

/// Default time to wait for a publisher confirmation.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that make a publish a delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Broker did not take the message within {0:?}")]
    SubmitTimeout(Duration),

    #[error("Broker refused the message")]
    Nacked,

    #[error("No confirmation within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("Transient delivery failure: {0}")]
    Bus(#[from] BusError),
}

/// Successful publish outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed and routed the message.
    Confirmed,
    /// The broker accepted the message but no queue was bound to the key.
    Unroutable,
}

/// Totals of a `publish_batch` call or of a `drain`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub confirmed: usize,
    pub unroutable: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.confirmed + self.unroutable + self.failed
    }

    fn record(&mut self, outcome: &Result<PublishOutcome, PublishError>) {
        match outcome {
            Ok(PublishOutcome::Confirmed) => self.confirmed += 1,
            Ok(PublishOutcome::Unroutable) => self.unroutable += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn record_joined(&mut self, joined: Result<Result<PublishOutcome, PublishError>, JoinError>) {
        match joined {
            Ok(outcome) => self.record(&outcome),
            Err(e) => {
                error!(error = %e, "Confirmation task failed");
                self.failed += 1;
            }
        }
    }
}

/// Emits domain-change notifications for class mutations.
///
/// Every method is fire-and-forget: it returns once the notification is
/// handed to the broker (or could not be), and delivery problems are only
/// logged. Nothing here can fail the mutation that triggered it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_created(&self, id: i64, name: &str);

    async fn notify_updated(&self, id: i64, name: &str);

    async fn notify_deleted(&self, id: i64, name: &str);

    /// Publish a FAILED event for an operation that did not complete.
    async fn notify_operation_failed(
        &self,
        id: Option<i64>,
        name: Option<&str>,
        action: Action,
        error_message: &str,
    );
}

/// Confirmations still outstanding, plus the totals of those already reaped.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<Result<PublishOutcome, PublishError>>,
    settled: BatchReport,
}

/// Publishes events to the main exchange under the fixed routing key.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn MessageBroker>,
    exchange: String,
    routing_key: String,
    confirm_timeout: Duration,
    in_flight: Arc<Mutex<InFlight>>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, topology: &Topology, confirm_timeout: Duration) -> Self {
        Self {
            broker,
            exchange: topology.exchange.clone(),
            routing_key: topology.routing_key.clone(),
            confirm_timeout,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    pub fn from_config(broker: Arc<dyn MessageBroker>, config: &BrokerConfig) -> Self {
        Self::new(
            broker,
            &Topology::from_config(config),
            Duration::from_millis(config.confirm_timeout_ms),
        )
    }

    /// Publish with an explicit routing key instead of the configured one.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize and publish one event, waiting for the broker's answer.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(entity_id = ?event.entity_id, action = %event.action, routing_key = %self.routing_key)
    )]
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome, PublishError> {
        let pending = self.submit(event).await?;
        settle(pending, self.exchange.clone(), self.confirm_timeout).await
    }

    /// Serialize and hand one event to the broker, leaving its confirmation
    /// to a tracked background task.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(entity_id = ?event.entity_id, action = %event.action, routing_key = %self.routing_key)
    )]
    async fn dispatch(&self, event: &Event) -> Result<(), PublishError> {
        let pending = self.submit(event).await?;
        let confirmation = settle(pending, self.exchange.clone(), self.confirm_timeout)
            .instrument(Span::current());

        let mut in_flight = self.in_flight();
        while let Some(joined) = in_flight.tasks.try_join_next() {
            in_flight.settled.record_joined(joined);
        }
        in_flight.tasks.spawn(confirmation);
        Ok(())
    }

    async fn submit(&self, event: &Event) -> Result<PendingConfirm, PublishError> {
        let body = match event.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                return Err(e.into());
            }
        };

        let submitted = tokio::time::timeout(
            self.confirm_timeout,
            self.broker.submit(&self.exchange, &self.routing_key, &body),
        )
        .await;

        match submitted {
            Ok(Ok(pending)) => Ok(pending),
            Ok(Err(e)) => {
                error!(exchange = %self.exchange, error = %e, "Event publish failed");
                Err(e.into())
            }
            Err(_) => {
                error!(
                    exchange = %self.exchange,
                    timeout = ?self.confirm_timeout,
                    "Broker did not take the event in time"
                );
                Err(PublishError::SubmitTimeout(self.confirm_timeout))
            }
        }
    }

    /// Wait for every outstanding notification confirmation.
    ///
    /// Reports everything settled since the previous drain, including
    /// confirmations that finished on their own in the meantime.
    pub async fn drain(&self) -> BatchReport {
        let InFlight { mut tasks, mut settled } = std::mem::take(&mut *self.in_flight());
        while let Some(joined) = tasks.join_next().await {
            settled.record_joined(joined);
        }

        debug!(
            confirmed = settled.confirmed,
            unroutable = settled.unroutable,
            failed = settled.failed,
            "Notification confirmations drained"
        );
        settled
    }

    async fn notify(&self, event: Event) {
        if let Err(e) = self.dispatch(&event).await {
            warn!(
                entity_id = ?event.entity_id,
                action = %event.action,
                error = %e,
                "Notification could not be submitted"
            );
            self.in_flight().settled.failed += 1;
        }
    }

    /// Publish many events with at most `concurrency` in flight.
    ///
    /// All publishes finish before this returns; nothing outlives the call.
    pub async fn publish_batch(&self, events: Vec<Event>, concurrency: usize) -> BatchReport {
        let outcomes: Vec<_> = futures::stream::iter(events)
            .map(|event| async move { self.publish(&event).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let report = outcomes
            .iter()
            .fold(BatchReport::default(), |mut report, outcome| {
                report.record(outcome);
                report
            });

        debug!(
            confirmed = report.confirmed,
            unroutable = report.unroutable,
            failed = report.failed,
            "Batch published"
        );
        report
    }
}

/// Await one confirmation and log its outcome.
async fn settle(
    pending: PendingConfirm,
    exchange: String,
    confirm_timeout: Duration,
) -> Result<PublishOutcome, PublishError> {
    match tokio::time::timeout(confirm_timeout, pending).await {
        Ok(Ok(Confirmation::Acked)) => {
            debug!(exchange = %exchange, "Event published");
            Ok(PublishOutcome::Confirmed)
        }
        Ok(Ok(Confirmation::Returned)) => {
            warn!(exchange = %exchange, "Event unroutable, returned by broker");
            Ok(PublishOutcome::Unroutable)
        }
        Ok(Ok(Confirmation::Nacked)) => {
            error!(exchange = %exchange, "Event publish negatively confirmed");
            Err(PublishError::Nacked)
        }
        Ok(Err(e)) => {
            error!(exchange = %exchange, error = %e, "Event publish failed");
            Err(e.into())
        }
        Err(_) => {
            error!(
                exchange = %exchange,
                timeout = ?confirm_timeout,
                "Event publish confirmation timed out"
            );
            Err(PublishError::ConfirmTimeout(confirm_timeout))
        }
    }
}

#[async_trait]
impl Notifier for EventPublisher {
    async fn notify_created(&self, id: i64, name: &str) {
        self.notify(Event::success(Some(id), Some(name), Action::Create, "Class created successfully"))
            .await
    }

    async fn notify_updated(&self, id: i64, name: &str) {
        self.notify(Event::success(Some(id), Some(name), Action::Update, "Class updated successfully"))
            .await
    }

    async fn notify_deleted(&self, id: i64, name: &str) {
        self.notify(Event::success(Some(id), Some(name), Action::Delete, "Class deleted successfully"))
            .await
    }

    async fn notify_operation_failed(
        &self,
        id: Option<i64>,
        name: Option<&str>,
        action: Action,
        error_message: &str,
    ) {
        self.notify(Event::failed(id, name, action, error_message)).await
    }
}
