//! Process startup: tracing setup and connecting to backends that may not
//! be up yet.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Install a fmt subscriber filtered by `CLASSBUS_LOG` (default "info").
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Call `connect` until it succeeds, backing off exponentially between
/// attempts (100ms doubling up to 5s). Gives up after `max_retries` attempts
/// and returns the last error.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    max_retries: u32,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_retries = max_retries.max(1);
    let mut delays = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_retries as usize - 1)
        .build();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match connect().await {
            Ok(connection) => {
                info!(service = %service_name, address = %address, attempt, "Connected");
                return Ok(connection);
            }
            Err(e) => e,
        };

        match delays.next() {
            Some(delay) => {
                warn!(
                    service = %service_name,
                    address = %address,
                    attempt,
                    max_retries,
                    error = %err,
                    delay = ?delay,
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                error!(
                    service = %service_name,
                    address = %address,
                    attempts = attempt,
                    error = %err,
                    "Giving up on connection"
                );
                return Err(err);
            }
        }
    }
}
