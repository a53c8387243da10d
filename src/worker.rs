use log::{error, info, warn};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::broker::{Consumer, Producer};
use crate::config::Config;
use crate::consumer::EventStream;
use crate::error::{Error, Result};
use crate::prober::SiteProber;
use crate::publisher::Publisher;
use crate::store::StatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceMode {
    /// Check once and report whether the status was delivered.
    Once,
    /// Check every `check_interval_secs` until cancelled.
    Loop,
}

/// Checks the configured site and publishes the result.
///
/// The topic is provisioned first; failing that is an error. In
/// [`ProduceMode::Once`] the returned flag says whether the broker confirmed
/// delivery. In [`ProduceMode::Loop`] failed deliveries are logged and the
/// loop carries on until `token` is cancelled.
///
/// The producer is flushed before returning, whatever the outcome.
pub async fn run_producer<P: Producer>(
    config: &Config,
    producer: P,
    mode: ProduceMode,
    token: CancellationToken,
) -> Result<bool> {
    let publisher = Publisher::new(producer, config);
    let prober = SiteProber::new(config);

    let outcome = produce(&publisher, &prober, config, mode, &token).await;
    publisher.flush().await;
    outcome
}

async fn produce<P: Producer>(
    publisher: &Publisher<P>,
    prober: &SiteProber,
    config: &Config,
    mode: ProduceMode,
    token: &CancellationToken,
) -> Result<bool> {
    publisher.ensure_topic().await?;

    if mode == ProduceMode::Once {
        let status = prober.check().await?;
        return Ok(publisher.send_status(&status).await);
    }

    info!("Starting site monitoring of {}", prober.url());
    info!("Check interval: {} seconds", config.check_interval_secs);

    loop {
        if token.is_cancelled() {
            info!("Shutdown requested, stopping monitor");
            break;
        }

        let status = prober.check().await?;
        match (status.status(), status.error()) {
            (Some(code), _) => {
                info!("{}: HTTP {code} in {} ms", status.url(), status.elapsed_ms());
            }
            (None, Some(err)) => warn!("{}: DOWN ({err})", status.url()),
            (None, None) => {}
        }
        if !publisher.send_status(&status).await {
            error!("Status for {} was not delivered", status.url());
        }

        // Interruptible sleep
        select! {
            () = sleep(config.check_interval()) => {},
            () = token.cancelled() => {
                info!("Shutdown requested during sleep");
                break;
            }
        }
    }

    info!("Site monitoring stopped gracefully");
    Ok(true)
}

/// Stores every consumed status until `token` is cancelled or the stream
/// fails.
///
/// Each status is written and committed to the store before its broker
/// offset is committed, so a crash can replay a status but never lose one.
pub async fn run_consumer<C: Consumer, S: StatusStore>(
    config: &Config,
    consumer: C,
    store: &mut S,
    token: CancellationToken,
) -> Result<()> {
    let mut events = EventStream::subscribe(consumer, &config.kafka_topic, token).await?;

    let outcome = async {
        while let Some(event) = events.next().await {
            let status = event?;
            info!("{status:?}");
            store.write(&status).await?;
            store.commit().await?;
            events.commit().await?;
        }
        Ok::<(), Error>(())
    }
    .await;

    events.close().await;
    outcome
}
