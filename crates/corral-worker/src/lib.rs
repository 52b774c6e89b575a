//! Code for the worker binary.
//!
//! A worker is bound at startup to one `(engine, index)` pair. It consumes
//! the engine's queue one delivery at a time, drives a fresh container
//! sandbox for each job, races the run against the engine's timeout, PUTs
//! the result (or error) artifact back to the front-end, and only then acks
//! the delivery.

pub mod config;
mod consumer;
mod dispatch;
mod frontend;
mod wrap;

pub use dispatch::{handle_delivery, FrontendClient, Sandbox};
pub use frontend::HttpFrontend;
pub use wrap::ContainerWrap;

use anyhow::{Context as _, Result};
use config::Config;
use consumer::BrokerConsumer;
use corral_base::EngineConfig;
use corral_util::stats::Stats;
use slog::{info, warn, Logger};
use std::sync::Arc;

/// The worker's run loop. Returns cleanly when the job limit is reached or
/// the subscription ends; a broker failure surfaces as an error, and the
/// supervisor relaunches us.
pub async fn main(
    config: &Config,
    engine: EngineConfig,
    stats: Arc<Stats>,
    log: Logger,
) -> Result<()> {
    let tag = format!("pid-{}", std::process::id());
    let mut consumer = BrokerConsumer::connect(config.broker, &engine.name, &tag)
        .await
        .context("subscribing to the engine queue")?;
    // TODO: pull the engine image before reading from the queue.
    let frontend = HttpFrontend::new(&config.frontend);
    let mut wrap = ContainerWrap::new(
        engine.clone(),
        config.index,
        config.jobs_dir.clone(),
        config.log_dir.clone(),
        log.clone(),
    );
    info!(log, "consuming"; "engine" => &engine.name, "tag" => &tag);

    let mut handled = 0u32;
    while config.job_limit == 0 || handled < config.job_limit {
        let Some(delivery) = consumer.next_delivery().await? else {
            warn!(log, "subscription ended; exiting");
            return Ok(());
        };
        handle_delivery(
            &mut wrap,
            &frontend,
            &engine.name,
            engine.timeout,
            &stats,
            &log,
            &delivery.body,
        )
        .await;
        // Acked whether the job succeeded or not; a failure that reached
        // the index must not redeliver forever.
        consumer.ack(delivery.delivery_id).await?;
        handled += 1;
    }

    info!(log, "job limit reached"; "handled" => handled);
    consumer.cancel().await?;
    Ok(())
}
