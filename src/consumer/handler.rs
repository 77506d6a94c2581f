//! Domain handlers invoked for accepted events.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use super::ConsumeError;
use crate::event::{Action, Event};

/// Reacts to a class change. Must be idempotent: the broker delivers at
/// least once.
#[async_trait]
pub trait DomainHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), ConsumeError>;
}

#[async_trait]
impl<T: DomainHandler + ?Sized> DomainHandler for Arc<T> {
    async fn handle(&self, event: &Event) -> Result<(), ConsumeError> {
        (**self).handle(event).await
    }
}

/// Baseline handler: logs each change.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl DomainHandler for LoggingHandler {
    async fn handle(&self, event: &Event) -> Result<(), ConsumeError> {
        let entity_name = event.entity_name.as_deref().unwrap_or("");
        match event.action {
            Action::Create => {
                info!(entity_id = ?event.entity_id, entity_name = %entity_name, "Class created")
            }
            Action::Update => {
                info!(entity_id = ?event.entity_id, entity_name = %entity_name, "Class updated")
            }
            Action::Delete => {
                info!(entity_id = ?event.entity_id, entity_name = %entity_name, "Class deleted")
            }
            Action::Unknown(ref other) => {
                debug!(action = %other, "No handling for action")
            }
        }
        Ok(())
    }
}

/// Identity used to recognise a redelivered event.
pub fn dedup_key(event: &Event) -> String {
    match event.event_id {
        Some(id) => id.to_string(),
        None => format!(
            "{}|{}|{}|{:?}",
            event
                .entity_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            event.action,
            event.timestamp.format(crate::event::TIMESTAMP_FORMAT),
            event.status
        ),
    }
}

/// Bounded set of processed event keys. Oldest keys are forgotten first.
#[derive(Debug)]
pub struct DedupLedger {
    capacity: usize,
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LedgerState::default()),
        }
    }

    /// Claim a key. Returns false if it is already present.
    pub fn claim(&self, key: &str) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.seen.contains(key) {
            return false;
        }
        state.seen.insert(key.to_string());
        state.order.push_back(key.to_string());
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        true
    }

    /// Give a key back after the handler failed on it.
    pub fn release(&self, key: &str) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.seen.remove(key) {
            state.order.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wraps a handler so each event runs at most once per ledger window.
pub struct Deduplicating<H> {
    inner: H,
    ledger: Arc<DedupLedger>,
}

impl<H: DomainHandler> Deduplicating<H> {
    pub fn new(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            ledger: Arc::new(DedupLedger::new(capacity)),
        }
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }
}

#[async_trait]
impl<H: DomainHandler> DomainHandler for Deduplicating<H> {
    async fn handle(&self, event: &Event) -> Result<(), ConsumeError> {
        let key = dedup_key(event);
        if !self.ledger.claim(&key) {
            debug!(key = %key, entity_id = ?event.entity_id, "Duplicate event, skipping handler");
            return Ok(());
        }

        let result = self.inner.handle(event).await;
        if result.is_err() {
            self.ledger.release(&key);
        }
        result
    }
}
