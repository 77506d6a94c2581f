//! End-to-end pipeline tests on the in-memory broker.
//!
//! Run with: cargo test --test pipeline
//!
//! Wires the class service, publisher, consumer pool and dead-letter sink the
//! same way the binary does, without any external services.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use classbus::bus::{DeathReason, InMemoryBroker, MessageBroker, Topology};
use classbus::cache::memory::InMemoryCache;
use classbus::cache::Cache;
use classbus::config::ConsumerConfig;
use classbus::consumer::{ConsumerPool, EventProcessor, PoolSettings};
use classbus::dlq::{ChannelDeadLetterRecorder, DeadLetter, DeadLetterSink};
use classbus::event::{Action, Event, TestDirective};
use classbus::model::ClassRequest;
use classbus::publisher::{EventPublisher, PublishOutcome};
use classbus::service::{ClassService, ServiceError};
use classbus::storage::memory::InMemoryClassRepository;

struct Pipeline {
    broker: InMemoryBroker,
    topology: Topology,
    pool: ConsumerPool,
    dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
    stop_sink: watch::Sender<bool>,
    sink_task: JoinHandle<()>,
}

impl Pipeline {
    async fn start() -> Self {
        let broker = InMemoryBroker::new();
        let topology = Topology::default();
        topology.declare(&broker).await.unwrap();

        let processor = Arc::new(EventProcessor::from_config(&ConsumerConfig::default()));
        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            topology.queue.clone(),
            processor,
            PoolSettings {
                concurrency: 2,
                max_concurrency: 4,
                prefetch: 1,
                idle_timeout: Duration::from_millis(200),
                scale_interval: Duration::from_millis(10),
            },
        );

        let (recorder, dead_letters) = ChannelDeadLetterRecorder::new();
        let sink = DeadLetterSink::new(
            Arc::new(broker.clone()),
            topology.dead_letter_queue.clone(),
            Arc::new(recorder),
        );
        let (stop_sink, shutdown) = watch::channel(false);
        let sink_task = tokio::spawn(async move {
            sink.run(shutdown).await.expect("dead-letter sink failed");
        });

        Self {
            broker,
            topology,
            pool,
            dead_letters,
            stop_sink,
            sink_task,
        }
    }

    fn publisher(&self) -> EventPublisher {
        EventPublisher::new(
            Arc::new(self.broker.clone()),
            &self.topology,
            Duration::from_secs(5),
        )
    }

    fn service(&self) -> ClassService {
        ClassService::new(
            Arc::new(InMemoryClassRepository::new()),
            Arc::new(InMemoryCache::new()),
            Arc::new(self.publisher()),
        )
    }

    async fn wait_until_settled(&self) {
        let broker = self.broker.clone();
        let queue = self.topology.queue.clone();
        wait_until(move || {
            broker.inspect(&queue).map(|m| m.is_empty()).unwrap_or(false)
                && broker.unacked_count(&queue) == 0
        })
        .await;
    }

    async fn next_dead_letter(&mut self) -> DeadLetter {
        tokio::time::timeout(Duration::from_secs(5), self.dead_letters.recv())
            .await
            .expect("no dead letter in time")
            .expect("recorder closed")
    }

    async fn stop(self) {
        self.pool.shutdown().await;
        let _ = self.stop_sink.send(true);
        self.sink_task.await.unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_crud_events_are_consumed() {
    let pipeline = Pipeline::start().await;
    let service = pipeline.service();

    let created = service.create(ClassRequest::new("Math")).await.unwrap();
    service
        .update(created.id, ClassRequest::new("Physics"))
        .await
        .unwrap();
    service.delete(created.id).await.unwrap();

    pipeline.wait_until_settled().await;
    assert_eq!(
        pipeline
            .broker
            .queue_depth(&pipeline.topology.dead_letter_queue)
            .await
            .unwrap(),
        0
    );
    pipeline.stop().await;
}

#[tokio::test]
async fn test_consumer_failure_trigger_lands_in_dead_letter_queue() {
    let mut pipeline = Pipeline::start().await;
    let event = Event::success(Some(7), Some("Math"), Action::Create, "ignored")
        .with_message("TRIGGER_CONSUMER_FAILURE");

    let outcome = pipeline.publisher().publish(&event).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Confirmed);

    let dead_letter = pipeline.next_dead_letter().await;
    assert_eq!(dead_letter.entity_id(), Some(7));
    assert_eq!(dead_letter.reason, Some(DeathReason::Rejected));
    assert_eq!(dead_letter.source_queue.as_deref(), Some(pipeline.topology.queue.as_str()));
    assert_eq!(dead_letter.count, 1);

    pipeline.wait_until_settled().await;
    assert!(pipeline.dead_letters.try_recv().is_err());
    pipeline.stop().await;
}

#[tokio::test]
async fn test_directive_is_dead_lettered() {
    let mut pipeline = Pipeline::start().await;
    let event = Event::success(Some(3), Some("Art"), Action::Update, "Class updated successfully")
        .with_directive(TestDirective::FailProcessing);

    pipeline.publisher().publish(&event).await.unwrap();

    let dead_letter = pipeline.next_dead_letter().await;
    assert_eq!(dead_letter.entity_id(), Some(3));
    assert_eq!(dead_letter.event, Some(event));
    pipeline.stop().await;
}

#[tokio::test]
async fn test_malformed_body_is_dead_lettered() {
    let mut pipeline = Pipeline::start().await;

    pipeline
        .broker
        .publish(
            &pipeline.topology.exchange,
            &pipeline.topology.routing_key,
            b"{not json",
        )
        .await
        .unwrap();

    let dead_letter = pipeline.next_dead_letter().await;
    assert!(dead_letter.event.is_none());
    assert_eq!(dead_letter.raw_body, "{not json");
    assert_eq!(dead_letter.reason, Some(DeathReason::Rejected));
    pipeline.stop().await;
}

#[tokio::test]
async fn test_replayed_event_is_not_dead_lettered() {
    let pipeline = Pipeline::start().await;
    let publisher = pipeline.publisher();
    let event = Event::success(Some(11), Some("Math"), Action::Create, "Class created successfully");

    publisher.publish(&event).await.unwrap();
    publisher.publish(&event).await.unwrap();

    pipeline.wait_until_settled().await;
    assert_eq!(
        pipeline
            .broker
            .queue_depth(&pipeline.topology.dead_letter_queue)
            .await
            .unwrap(),
        0
    );
    pipeline.stop().await;
}

#[tokio::test]
async fn test_get_after_create_then_delete() {
    let pipeline = Pipeline::start().await;
    let cache = Arc::new(InMemoryCache::new());
    let service = ClassService::new(
        Arc::new(InMemoryClassRepository::new()),
        cache.clone(),
        Arc::new(pipeline.publisher()),
    );

    let created = service.create(ClassRequest::new("History")).await.unwrap();
    assert!(cache.exists(&format!("class:{}", created.id)).await.unwrap());

    let fetched = service.get_by_id(created.id).await.unwrap();
    assert_eq!(fetched, created);

    service.delete(created.id).await.unwrap();
    assert!(!cache.exists(&format!("class:{}", created.id)).await.unwrap());
    assert!(matches!(
        service.get_by_id(created.id).await,
        Err(ServiceError::NotFound { id }) if id == created.id
    ));
    pipeline.stop().await;
}

#[tokio::test]
async fn test_unroutable_publish_does_not_fail_the_write() {
    let pipeline = Pipeline::start().await;
    let publisher = pipeline.publisher().with_routing_key("nobody.listens");
    let service = ClassService::new(
        Arc::new(InMemoryClassRepository::new()),
        Arc::new(InMemoryCache::new()),
        Arc::new(publisher),
    );

    let created = service.create(ClassRequest::new("Music")).await.unwrap();

    assert_eq!(created.name, "Music");
    assert_eq!(pipeline.broker.queue_depth(&pipeline.topology.queue).await.unwrap(), 0);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_nacked_publish_does_not_fail_the_write() {
    let pipeline = Pipeline::start().await;
    pipeline.broker.set_nack_publishes(true);
    let service = pipeline.service();

    let created = service.create(ClassRequest::new("Chemistry")).await.unwrap();

    assert_eq!(service.get_by_id(created.id).await.unwrap().name, "Chemistry");
    pipeline.stop().await;
}

#[tokio::test]
async fn test_service_without_notifications_publishes_nothing() {
    let pipeline = Pipeline::start().await;
    let service = ClassService::without_notifications(
        Arc::new(InMemoryClassRepository::new()),
        Arc::new(InMemoryCache::new()),
    );

    let created = service.create(ClassRequest::new("Latin")).await.unwrap();
    service.delete(created.id).await.unwrap();

    assert!(pipeline.broker.inspect(&pipeline.topology.queue).unwrap().is_empty());
    assert_eq!(pipeline.broker.unacked_count(&pipeline.topology.queue), 0);
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unconsumed_event_expires_into_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let topology = Topology::default();
    topology.declare(&broker).await.unwrap();
    let publisher = EventPublisher::new(Arc::new(broker.clone()), &topology, Duration::from_secs(5));
    let event = Event::success(Some(5), Some("Biology"), Action::Delete, "Class deleted successfully");

    publisher.publish(&event).await.unwrap();
    tokio::time::advance(topology.message_ttl + Duration::from_secs(1)).await;

    assert!(broker.inspect(&topology.queue).unwrap().is_empty());
    let mut stream = broker
        .consume(&topology.dead_letter_queue, "expiry-test", 1)
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();

    let (recorder, mut dead_letters) = ChannelDeadLetterRecorder::new();
    let sink = DeadLetterSink::new(
        Arc::new(broker.clone()),
        topology.dead_letter_queue.clone(),
        Arc::new(recorder),
    );
    let dead_letter = sink.handle(delivery).await;

    assert_eq!(dead_letter.reason, Some(DeathReason::Expired));
    assert_eq!(dead_letter.entity_id(), Some(5));
    assert_eq!(dead_letters.recv().await.unwrap(), dead_letter);
    assert_eq!(broker.unacked_count(&topology.dead_letter_queue), 0);
}
