//! Main queue consumer.
//!
//! Each delivery goes `received -> classify -> {accept, reject}`:
//! - a body that is not a valid event is rejected
//! - an event carrying a failure directive is rejected
//! - CREATE/UPDATE/DELETE are dispatched to the domain handler
//! - any other action is accepted with a warning
//!
//! Rejections never requeue, so the broker dead-letters the message on the
//! first failure.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bus::Delivery;
use crate::config::ConsumerConfig;
use crate::event::{Action, Event, TestDirective};

pub mod classify;
pub mod handler;
pub mod pool;

pub use classify::PoisonClassifier;
pub use handler::{DedupLedger, Deduplicating, DomainHandler, LoggingHandler};
pub use pool::{ConsumerPool, PoolSettings};

/// Why a delivery was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Poison message: {directive}")]
    Poison { directive: TestDirective },

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Final decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accept,
    Reject,
}

/// Classifies and dispatches deliveries from the main queue.
pub struct EventProcessor {
    classifier: PoisonClassifier,
    handler: Arc<dyn DomainHandler>,
}

impl EventProcessor {
    pub fn new(classifier: PoisonClassifier, handler: Arc<dyn DomainHandler>) -> Self {
        Self { classifier, handler }
    }

    /// Logging handler behind a de-duplication ledger, as configured.
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(
            PoisonClassifier::new(config.legacy_markers),
            Arc::new(Deduplicating::new(LoggingHandler, config.dedup_capacity)),
        )
    }

    /// Decide what to do with a raw message body.
    pub async fn process(&self, body: &[u8]) -> Result<(), ConsumeError> {
        let event = Event::from_json(body)?;

        if let Some(directive) = self.classifier.classify(&event) {
            return Err(ConsumeError::Poison { directive });
        }

        match &event.action {
            Action::Create | Action::Update | Action::Delete => self.handler.handle(&event).await,
            Action::Unknown(action) => {
                warn!(action = %action, entity_id = ?event.entity_id, "Unknown action, accepting");
                Ok(())
            }
        }
    }

    /// Process one delivery and settle it with the broker.
    #[tracing::instrument(
        name = "bus.consume",
        skip_all,
        fields(routing_key = %delivery.routing_key, redelivered = delivery.redelivered)
    )]
    pub async fn handle_delivery(&self, delivery: Delivery) -> Disposition {
        let disposition = match self.process(&delivery.body).await {
            Ok(()) => Disposition::Accept,
            Err(ConsumeError::Poison { directive }) => {
                error!(directive = %directive, "Poison message, rejecting to dead-letter queue");
                Disposition::Reject
            }
            Err(e) => {
                error!(error = %e, "Event processing failed, rejecting to dead-letter queue");
                Disposition::Reject
            }
        };

        let settled = match disposition {
            Disposition::Accept => delivery.ack().await,
            Disposition::Reject => delivery.reject(false).await,
        };
        match settled {
            Ok(()) => debug!(disposition = ?disposition, "Delivery settled"),
            Err(e) => warn!(error = %e, "Failed to settle delivery"),
        }

        disposition
    }
}
