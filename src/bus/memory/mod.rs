//! In-process broker for standalone mode and tests.
//!
//! Implements the subset of broker behaviour the pipeline relies on:
//! - direct exchanges routing by exact key
//! - publisher confirms and mandatory returns
//! - per-queue message TTL measured from enqueue time
//! - dead-lettering on reject-without-requeue and on expiry, with `x-death`
//!   style history
//! - competing consumers with at-most-one-owner per message
//!
//! Time is read from `tokio::time`, so tests can pause and advance it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Acknowledger, BindingSpec, BusError, Confirmation, DeathReason, DeathRecord, Delivery,
    DeliveryStream, ExchangeSpec, MessageBroker, PendingConfirm, QueueSpec, Result,
};

#[derive(Debug, Clone)]
struct Envelope {
    body: Vec<u8>,
    routing_key: String,
    enqueued_at: Instant,
    delivery_count: u32,
    deaths: Vec<DeathRecord>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    unacked: HashMap<u64, Envelope>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }

    fn expiry_of(&self, envelope: &Envelope) -> Option<Instant> {
        self.spec.message_ttl.map(|ttl| envelope.enqueued_at + ttl)
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    next_tag: u64,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect()
    }

    fn enqueue(&mut self, queue: &str, envelope: Envelope) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(envelope);
        }
    }

    /// Move a message from `from_queue` to its dead-letter target.
    fn dead_letter(&mut self, from_queue: &str, mut envelope: Envelope, reason: DeathReason) {
        let Some(q) = self.queues.get(from_queue) else {
            return;
        };
        let Some(dlx) = q.spec.dead_letter_exchange.clone() else {
            debug!(queue = %from_queue, reason = %reason, "No dead-letter exchange, dropping message");
            return;
        };
        let routing_key = q
            .spec
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| envelope.routing_key.clone());

        // Most recent death first, as in `x-death`.
        let record = match envelope
            .deaths
            .iter()
            .position(|d| d.queue == from_queue && d.reason == reason)
        {
            Some(index) => {
                let mut existing = envelope.deaths.remove(index);
                existing.count += 1;
                existing
            }
            None => DeathRecord {
                reason: reason.clone(),
                queue: from_queue.to_string(),
                count: 1,
            },
        };
        envelope.deaths.insert(0, record);

        let targets = self.route(&dlx, &routing_key);
        if targets.is_empty() {
            warn!(
                queue = %from_queue,
                dead_letter_exchange = %dlx,
                routing_key = %routing_key,
                "Dead-letter target has no binding, message dropped"
            );
            return;
        }

        debug!(
            queue = %from_queue,
            dead_letter_exchange = %dlx,
            reason = %reason,
            "Dead-lettered message"
        );

        for target in targets {
            let copy = Envelope {
                body: envelope.body.clone(),
                routing_key: routing_key.clone(),
                enqueued_at: Instant::now(),
                delivery_count: 0,
                deaths: envelope.deaths.clone(),
            };
            self.enqueue(&target, copy);
        }
    }

    /// Dead-letter every ready message whose TTL has elapsed.
    fn expire_due(&mut self, now: Instant) -> bool {
        let mut expired = Vec::new();
        for (name, q) in self.queues.iter_mut() {
            let Some(ttl) = q.spec.message_ttl else {
                continue;
            };
            let (dead, alive): (VecDeque<_>, VecDeque<_>) = q
                .ready
                .drain(..)
                .partition(|e| e.enqueued_at + ttl <= now);
            q.ready = alive;
            expired.extend(dead.into_iter().map(|e| (name.clone(), e)));
        }

        let any = !expired.is_empty();
        for (queue, envelope) in expired {
            self.dead_letter(&queue, envelope, DeathReason::Expired);
        }
        any
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .flat_map(|q| q.ready.iter().filter_map(move |e| q.expiry_of(e)))
            .min()
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    nack_publishes: AtomicBool,
    confirm_delay: Mutex<Option<Duration>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) {
        let mut state = self.state();
        let Some(envelope) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
        else {
            return;
        };

        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_front(envelope);
                }
            }
            Settle::DeadLetter => state.dead_letter(queue, envelope, DeathReason::Rejected),
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

/// Snapshot of a ready message, for inspection in tests and tooling.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub deaths: Vec<DeathRecord>,
}

/// In-memory broker. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                nack_publishes: AtomicBool::new(false),
                confirm_delay: Mutex::new(None),
            }),
        }
    }

    /// Make every subsequent publish come back negatively confirmed.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.shared.nack_publishes.store(nack, Ordering::SeqCst);
    }

    /// Delay publisher confirmations, to exercise confirmation timeouts.
    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        *self
            .shared
            .confirm_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Ready messages of a queue, oldest first. Expired messages are
    /// dead-lettered before the snapshot is taken.
    pub fn inspect(&self, queue: &str) -> Result<Vec<QueuedMessage>> {
        let mut state = self.shared.state();
        state.expire_due(Instant::now());
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        Ok(q.ready
            .iter()
            .map(|e| QueuedMessage {
                body: e.body.clone(),
                routing_key: e.routing_key.clone(),
                deaths: e.deaths.clone(),
            })
            .collect())
    }

    /// Messages delivered to a consumer and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Dead-letter expired messages now. Consumers and inspections do this
    /// implicitly.
    pub fn expire_now(&self) {
        let expired = self.shared.state().expire_due(Instant::now());
        if expired {
            self.shared.notify.notify_waiters();
        }
    }

    /// Enqueue a published message on every bound queue.
    fn route_publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Confirmation {
        let mut state = self.shared.state();
        if !state.exchanges.contains_key(exchange) {
            warn!(exchange = %exchange, "Publish to undeclared exchange");
            return Confirmation::Nacked;
        }

        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            return Confirmation::Returned;
        }
        let now = Instant::now();
        for target in targets {
            state.enqueue(
                &target,
                Envelope {
                    body: body.to_vec(),
                    routing_key: routing_key.to_string(),
                    enqueued_at: now,
                    delivery_count: 0,
                    deaths: Vec::new(),
                },
            );
        }
        Confirmation::Acked
    }

    /// Wait for the next message on `queue` and mark it unacked.
    async fn next_delivery(shared: Arc<Shared>, queue: String) -> Result<Delivery> {
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = shared.state();
                if state.expire_due(Instant::now()) {
                    shared.notify.notify_waiters();
                }

                let tag = state.next_tag + 1;
                let q = state
                    .queues
                    .get_mut(&queue)
                    .ok_or_else(|| BusError::UnknownQueue(queue.clone()))?;

                if let Some(mut envelope) = q.ready.pop_front() {
                    envelope.delivery_count += 1;
                    let delivery = Delivery::new(
                        envelope.body.clone(),
                        envelope.routing_key.clone(),
                        envelope.delivery_count > 1,
                        envelope.deaths.clone(),
                        Box::new(MemoryAcker::new(Arc::clone(&shared), queue.clone(), tag)),
                    );
                    q.unacked.insert(tag, envelope);
                    state.next_tag = tag;
                    return Ok(delivery);
                }

                state.next_expiry()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let mut state = self.shared.state();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BusError::Declare(format!(
                "exchange '{}' already declared with different properties",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.shared.state();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BusError::Declare(format!(
                "queue '{}' already declared with different arguments",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        let mut state = self.shared.state();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BusError::Declare(format!(
                "exchange '{}' not declared",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::UnknownQueue(binding.queue.clone()));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn submit(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<PendingConfirm> {
        let delay = *self
            .shared
            .confirm_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let confirmation = if self.shared.nack_publishes.load(Ordering::SeqCst) {
            Confirmation::Nacked
        } else {
            self.route_publish(exchange, routing_key, body)
        };
        if confirmation == Confirmation::Acked {
            self.shared.notify.notify_waiters();
        }

        Ok(Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(confirmation)
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, _prefetch: u16) -> Result<DeliveryStream> {
        if !self.shared.state().queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        debug!(queue = %queue, consumer_tag = %consumer_tag, "In-memory consumer started");

        let shared = Arc::clone(&self.shared);
        let queue = queue.to_string();
        let stream = futures::stream::unfold((shared, queue), |(shared, queue)| async move {
            let next = Self::next_delivery(Arc::clone(&shared), queue.clone()).await;
            Some((next, (shared, queue)))
        });
        Ok(Box::pin(stream))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let mut state = self.shared.state();
        if state.expire_due(Instant::now()) {
            self.shared.notify.notify_waiters();
        }
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))
    }
}

/// Settles one in-memory delivery.
///
/// Dropping an unsettled acker returns the message to the head of its queue,
/// the way a broker recovers deliveries of a closed channel.
struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn new(shared: Arc<Shared>, queue: String, tag: u64) -> Self {
        Self {
            shared,
            queue,
            tag,
            settled: AtomicBool::new(false),
        }
    }

    fn settle_once(&self, outcome: Settle) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Acknowledge(format!(
                "delivery {} already settled",
                self.tag
            )));
        }
        self.shared.settle(&self.queue, self.tag, outcome);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle_once(Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle_once(if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.shared.settle(&self.queue, self.tag, Settle::Requeue);
        }
    }
}

#[cfg(test)]
mod tests;
