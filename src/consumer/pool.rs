//! Scaling pool of competing consumers on the main queue.
//!
//! A supervisor keeps `concurrency` workers alive and, while the queue has a
//! backlog, adds one worker per scale tick up to `max_concurrency`. Workers
//! above the floor retire after `idle_timeout` without a delivery. Each
//! worker owns its own broker consumer and reconnects with exponential
//! backoff when its stream fails.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::EventProcessor;
use crate::bus::MessageBroker;
use crate::config::ConsumerConfig;

/// Sizing and timing of a consumer pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub max_concurrency: usize,
    pub prefetch: u16,
    pub idle_timeout: Duration,
    pub scale_interval: Duration,
}

impl From<&ConsumerConfig> for PoolSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_concurrency: config.max_concurrency,
            prefetch: config.prefetch,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            scale_interval: Duration::from_millis(config.scale_interval_ms),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Shutdown,
    Retired,
}

struct PoolContext {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    processor: Arc<EventProcessor>,
    settings: PoolSettings,
    active: AtomicUsize,
    backoff: ExponentialBuilder,
}

/// Handle to a running consumer pool.
pub struct ConsumerPool {
    context: Arc<PoolContext>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl ConsumerPool {
    /// Start the floor workers and the scaling supervisor.
    pub fn start(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        processor: Arc<EventProcessor>,
        settings: PoolSettings,
    ) -> Self {
        let max_concurrency = settings.max_concurrency.max(settings.concurrency).max(1);
        let settings = PoolSettings {
            concurrency: settings.concurrency.max(1),
            max_concurrency,
            ..settings
        };

        let context = Arc::new(PoolContext {
            broker,
            queue: queue.into(),
            processor,
            settings,
            active: AtomicUsize::new(0),
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(30))
                .with_jitter(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(Arc::clone(&context), shutdown_rx));

        info!(
            queue = %context.queue,
            concurrency = context.settings.concurrency,
            max_concurrency = context.settings.max_concurrency,
            "Consumer pool started"
        );

        Self {
            context,
            shutdown,
            supervisor,
        }
    }

    /// Number of workers currently running.
    pub fn active_workers(&self) -> usize {
        self.context.active.load(Ordering::SeqCst)
    }

    /// Stop all workers. In-flight deliveries are settled first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.supervisor.await {
            error!(error = %e, "Consumer pool supervisor panicked");
        }
        info!(queue = %self.context.queue, "Consumer pool stopped");
    }
}

async fn supervise(context: Arc<PoolContext>, mut shutdown: watch::Receiver<bool>) {
    let mut workers = JoinSet::new();
    let mut next_id = 0usize;
    let worker_shutdown = shutdown.clone();

    let mut spawn = |workers: &mut JoinSet<WorkerExit>, elastic: bool| {
        next_id += 1;
        context.active.fetch_add(1, Ordering::SeqCst);
        workers.spawn(run_worker(
            Arc::clone(&context),
            next_id,
            elastic,
            worker_shutdown.clone(),
        ));
    };

    for _ in 0..context.settings.concurrency {
        spawn(&mut workers, false);
    }

    let mut ticker = tokio::time::interval(context.settings.scale_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(joined) = workers.join_next() => {
                match joined {
                    Ok(WorkerExit::Retired) => debug!(queue = %context.queue, "Idle worker retired"),
                    Ok(WorkerExit::Shutdown) => {}
                    Err(e) => {
                        context.active.fetch_sub(1, Ordering::SeqCst);
                        error!(queue = %context.queue, error = %e, "Consumer worker panicked");
                    }
                }
                if context.active.load(Ordering::SeqCst) < context.settings.concurrency {
                    spawn(&mut workers, false);
                }
            }
            _ = ticker.tick() => {
                let active = context.active.load(Ordering::SeqCst);
                if active >= context.settings.max_concurrency {
                    continue;
                }
                match context.broker.queue_depth(&context.queue).await {
                    Ok(depth) if depth > 0 => {
                        debug!(queue = %context.queue, depth, active, "Backlog, adding worker");
                        spawn(&mut workers, true);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(queue = %context.queue, error = %e, "Failed to sample queue depth"),
                }
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(queue = %context.queue, error = %e, "Consumer worker panicked");
        }
    }
}

/// Consume until shutdown or, for elastic workers, until idle.
async fn run_worker(
    context: Arc<PoolContext>,
    id: usize,
    elastic: bool,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerExit {
    let exit = worker_loop(&context, id, elastic, &mut shutdown).await;
    context.active.fetch_sub(1, Ordering::SeqCst);
    exit
}

async fn worker_loop(
    context: &PoolContext,
    id: usize,
    elastic: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> WorkerExit {
    let consumer_tag = format!("{}-worker-{}", context.queue, id);
    let mut backoff = context.backoff.build();

    loop {
        if *shutdown.borrow() {
            return WorkerExit::Shutdown;
        }

        match context
            .broker
            .consume(&context.queue, &consumer_tag, context.settings.prefetch)
            .await
        {
            Ok(mut stream) => {
                debug!(consumer_tag = %consumer_tag, elastic, "Worker consuming");
                loop {
                    let idle = async {
                        if elastic {
                            tokio::time::sleep(context.settings.idle_timeout).await
                        } else {
                            std::future::pending::<()>().await
                        }
                    };

                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => return WorkerExit::Shutdown,
                        _ = idle => return WorkerExit::Retired,
                        next = stream.next() => match next {
                            Some(Ok(delivery)) => {
                                backoff = context.backoff.build();
                                context.processor.handle_delivery(delivery).await;
                            }
                            Some(Err(e)) => {
                                warn!(consumer_tag = %consumer_tag, error = %e, "Delivery stream failed");
                                break;
                            }
                            None => {
                                warn!(consumer_tag = %consumer_tag, "Delivery stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(consumer_tag = %consumer_tag, error = %e, "Failed to start consumer");
            }
        }

        let delay = backoff.next().unwrap_or(Duration::from_secs(30));
        debug!(consumer_tag = %consumer_tag, delay = ?delay, "Reconnecting consumer");
        tokio::select! {
            _ = shutdown.changed() => return WorkerExit::Shutdown,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
