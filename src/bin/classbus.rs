//! classbus: class event pipeline runner
//!
//! Connects persistence, cache and broker, declares the broker topology, then
//! runs the main-queue consumer pool and the dead-letter sink until Ctrl-C.
//!
//! ## Architecture
//! ```text
//! [publisher] --> [class.exchange] --> [class.queue] --> consumer pool
//!                                           |
//!                                  reject / TTL expiry
//!                                           v
//!                  [class.dead-letter.exchange] --> [class.dead-letter.queue] --> dead-letter sink
//! ```
//!
//! ## Configuration
//! - CLASSBUS_CONFIG: Path to a YAML config file (optional)
//! - CLASSBUS__<SECTION>__<KEY>: Overrides of individual settings
//! - CLASSBUS_LOG: Log filter (default: info)

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use classbus::bus::{init_broker, Topology};
use classbus::cache::init_cache;
use classbus::config::Config;
use classbus::consumer::{ConsumerPool, EventProcessor, PoolSettings};
use classbus::dlq::{DeadLetterSink, NoopDeadLetterRecorder};
use classbus::publisher::EventPublisher;
use classbus::service::ClassService;
use classbus::storage::init_storage;
use classbus::utils::bootstrap::{connect_with_retry, init_tracing};

const CONNECT_RETRIES: u32 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let broker = connect_with_retry("broker", &config.broker.url, CONNECT_RETRIES, || {
        init_broker(&config.broker)
    })
    .await?;

    let repository = init_storage(&config.storage).await?;
    let cache = connect_with_retry("cache", &config.cache.url, CONNECT_RETRIES, || {
        init_cache(&config.cache)
    })
    .await?;

    let topology = Topology::from_config(&config.broker);
    topology.declare(broker.as_ref()).await?;

    let publisher = Arc::new(EventPublisher::from_config(Arc::clone(&broker), &config.broker));
    let classes = ClassService::new(Arc::clone(&repository), Arc::clone(&cache), publisher.clone())
        .with_namespace(config.cache.namespace.clone());
    let simple_classes = ClassService::without_notifications(repository, cache)
        .with_namespace(config.cache.simple_namespace.clone());
    let existing = classes.list().await?;
    info!(
        classes = existing.len(),
        namespace = %classes.namespace(),
        simple_namespace = %simple_classes.namespace(),
        "Class services ready"
    );

    let processor = Arc::new(EventProcessor::from_config(&config.consumer));
    let pool = ConsumerPool::start(
        Arc::clone(&broker),
        topology.queue.clone(),
        processor,
        PoolSettings::from(&config.consumer),
    );

    let sink = DeadLetterSink::new(
        Arc::clone(&broker),
        topology.dead_letter_queue.clone(),
        Arc::new(NoopDeadLetterRecorder),
    );
    let (stop_sink, sink_shutdown) = watch::channel(false);
    let sink_task = tokio::spawn(async move { sink.run(sink_shutdown).await });

    info!(
        queue = %topology.queue,
        dead_letter_queue = %topology.dead_letter_queue,
        "classbus started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let notifications = publisher.drain().await;
    info!(
        confirmed = notifications.confirmed,
        unroutable = notifications.unroutable,
        failed = notifications.failed,
        "Outstanding notifications settled"
    );

    let _ = stop_sink.send(true);
    pool.shutdown().await;
    match sink_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Dead-letter sink failed"),
        Err(e) => error!(error = %e, "Dead-letter sink panicked"),
    }

    info!("classbus stopped");
    Ok(())
}
