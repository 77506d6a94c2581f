use super::*;
use crate::bus::Topology;
use futures::StreamExt;

async fn declared() -> (InMemoryBroker, Topology) {
    let broker = InMemoryBroker::new();
    let topology = Topology::default();
    topology.declare(&broker).await.unwrap();
    (broker, topology)
}

async fn publish_main(broker: &InMemoryBroker, topology: &Topology, body: &[u8]) -> Confirmation {
    broker
        .publish(&topology.exchange, &topology.routing_key, body)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_publish_routes_by_exact_key() {
    let (broker, topology) = declared().await;

    let confirmation = publish_main(&broker, &topology, b"one").await;

    assert_eq!(confirmation, Confirmation::Acked);
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 1);
    assert_eq!(broker.queue_depth(&topology.dead_letter_queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unbound_routing_key_is_returned() {
    let (broker, topology) = declared().await;

    let confirmation = broker
        .publish(&topology.exchange, "no.such.key", b"lost")
        .await
        .unwrap();

    assert_eq!(confirmation, Confirmation::Returned);
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_undeclared_exchange_is_nacked() {
    let (broker, _) = declared().await;

    let confirmation = broker.publish("missing", "key", b"x").await.unwrap();

    assert_eq!(confirmation, Confirmation::Nacked);
}

#[tokio::test]
async fn test_forced_nack() {
    let (broker, topology) = declared().await;
    broker.set_nack_publishes(true);

    assert_eq!(publish_main(&broker, &topology, b"x").await, Confirmation::Nacked);
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_redeclare_with_different_arguments_fails() {
    let (broker, topology) = declared().await;
    let mut queue = topology.main_queue();
    queue.message_ttl = None;

    let result = broker.declare_queue(&queue).await;

    assert!(matches!(result, Err(BusError::Declare(_))));
}

#[tokio::test]
async fn test_ack_removes_message() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"hello").await;

    let mut stream = broker.consume(&topology.queue, "t", 1).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.body, b"hello");
    assert!(!delivery.redelivered);
    assert_eq!(broker.unacked_count(&topology.queue), 1);

    delivery.ack().await.unwrap();

    assert_eq!(broker.unacked_count(&topology.queue), 0);
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 0);
    assert_eq!(broker.queue_depth(&topology.dead_letter_queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reject_without_requeue_dead_letters() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"bad").await;

    let mut stream = broker.consume(&topology.queue, "t", 1).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    delivery.reject(false).await.unwrap();

    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 0);
    let dead = broker.inspect(&topology.dead_letter_queue).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"bad");
    assert_eq!(dead[0].routing_key, topology.dead_letter_queue);
    assert_eq!(dead[0].deaths[0].reason, DeathReason::Rejected);
    assert_eq!(dead[0].deaths[0].queue, topology.queue);
    assert_eq!(dead[0].deaths[0].count, 1);
}

#[tokio::test]
async fn test_reject_with_requeue_redelivers() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"again").await;

    let mut stream = broker.consume(&topology.queue, "t", 1).await.unwrap();
    stream.next().await.unwrap().unwrap().reject(true).await.unwrap();

    let second = stream.next().await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.body, b"again");
    second.ack().await.unwrap();
}

#[tokio::test]
async fn test_dropped_delivery_is_recovered() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"crash").await;

    let mut stream = broker.consume(&topology.queue, "t", 1).await.unwrap();
    drop(stream.next().await.unwrap().unwrap());

    assert_eq!(broker.unacked_count(&topology.queue), 0);
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 1);
}

#[tokio::test]
async fn test_double_settle_fails() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"x").await;

    let mut stream = broker.consume(&topology.queue, "t", 1).await.unwrap();
    stream.next().await.unwrap().unwrap().ack().await.unwrap();

    let acker = MemoryAcker::new(Arc::clone(&broker.shared), topology.queue.clone(), 1);
    acker.reject(false).await.unwrap();
    assert!(acker.ack().await.is_err());
    assert_eq!(broker.queue_depth(&topology.dead_letter_queue).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_dead_letters_without_consumer() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"stale").await;

    tokio::time::advance(Duration::from_millis(299_999)).await;
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(broker.queue_depth(&topology.queue).await.unwrap(), 0);

    let dead = broker.inspect(&topology.dead_letter_queue).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].deaths[0].reason, DeathReason::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_dlq_consumer_sees_expired_message() {
    let (broker, topology) = declared().await;
    let mut dlq = broker
        .consume(&topology.dead_letter_queue, "dlq", 1)
        .await
        .unwrap();
    publish_main(&broker, &topology, b"late").await;

    let delivery = tokio::time::timeout(Duration::from_secs(600), dlq.next())
        .await
        .expect("expired message should reach the DLQ")
        .unwrap()
        .unwrap();

    assert_eq!(delivery.body, b"late");
    assert_eq!(delivery.last_death().unwrap().reason, DeathReason::Expired);
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn test_competing_consumers_each_get_distinct_messages() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"a").await;
    publish_main(&broker, &topology, b"b").await;

    let mut first = broker.consume(&topology.queue, "c1", 1).await.unwrap();
    let mut second = broker.consume(&topology.queue, "c2", 1).await.unwrap();

    let one = first.next().await.unwrap().unwrap();
    let two = second.next().await.unwrap().unwrap();

    assert_ne!(one.body, two.body);
    one.ack().await.unwrap();
    two.ack().await.unwrap();
}

#[tokio::test]
async fn test_consume_unknown_queue_fails() {
    let broker = InMemoryBroker::new();
    assert!(matches!(
        broker.consume("nope", "t", 1).await,
        Err(BusError::UnknownQueue(_))
    ));
}

/// Queue whose dead-letter exchange routes straight back into it.
async fn looping_queue(broker: &InMemoryBroker, ttl: Duration) -> QueueSpec {
    let exchange = ExchangeSpec {
        name: "loop.exchange".to_string(),
        durable: true,
        auto_delete: false,
    };
    let dead_letter_exchange = ExchangeSpec {
        name: "loop.dead-letter".to_string(),
        ..exchange.clone()
    };
    let queue = QueueSpec {
        name: "loop.queue".to_string(),
        durable: true,
        dead_letter_exchange: Some(dead_letter_exchange.name.clone()),
        dead_letter_routing_key: Some("retry".to_string()),
        message_ttl: Some(ttl),
    };
    broker.declare_exchange(&exchange).await.unwrap();
    broker.declare_exchange(&dead_letter_exchange).await.unwrap();
    broker.declare_queue(&queue).await.unwrap();
    for (exchange, routing_key) in [(&exchange, "work"), (&dead_letter_exchange, "retry")] {
        broker
            .bind_queue(&BindingSpec {
                queue: queue.name.clone(),
                exchange: exchange.name.clone(),
                routing_key: routing_key.to_string(),
            })
            .await
            .unwrap();
    }
    queue
}

#[tokio::test(start_paused = true)]
async fn test_expire_now_dead_letters_due_messages() {
    let (broker, topology) = declared().await;
    publish_main(&broker, &topology, b"due").await;
    tokio::time::advance(topology.message_ttl).await;

    broker.expire_now();

    let state = broker.shared.state();
    assert!(state.queues[&topology.queue].ready.is_empty());
    let dead = &state.queues[&topology.dead_letter_queue].ready;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].deaths[0].reason, DeathReason::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_recurring_death_moves_to_front() {
    let broker = InMemoryBroker::new();
    let ttl = Duration::from_secs(1);
    let queue = looping_queue(&broker, ttl).await;
    broker.publish("loop.exchange", "work", b"cycle").await.unwrap();

    let mut stream = broker.consume(&queue.name, "t", 1).await.unwrap();
    stream.next().await.unwrap().unwrap().reject(false).await.unwrap();
    tokio::time::advance(ttl).await;
    broker.expire_now();
    stream.next().await.unwrap().unwrap().reject(false).await.unwrap();
    drop(stream);

    let ready = broker.inspect(&queue.name).unwrap();
    assert_eq!(ready.len(), 1);
    let deaths = &ready[0].deaths;
    assert_eq!(deaths.len(), 2);
    assert_eq!(deaths[0].reason, DeathReason::Rejected);
    assert_eq!(deaths[0].count, 2);
    assert_eq!(deaths[1].reason, DeathReason::Expired);
    assert_eq!(deaths[1].count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_submit_enqueues_before_confirmation() {
    let (broker, topology) = declared().await;
    broker.set_confirm_delay(Some(Duration::from_secs(30)));

    let pending = broker
        .submit(&topology.exchange, &topology.routing_key, b"early")
        .await
        .unwrap();

    assert_eq!(broker.inspect(&topology.queue).unwrap().len(), 1);
    let started = Instant::now();
    assert_eq!(pending.await.unwrap(), Confirmation::Acked);
    assert!(started.elapsed() >= Duration::from_secs(30));
}
