//! NATS message handlers

pub mod cron;
pub mod ping;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info};

use crate::services::cron::CronRunner;
use crate::services::logger::BufferedLogger;
use crate::services::rate_limit::RateLimitService;

/// Start all message handlers
pub async fn start_handlers(
    client: Client,
    runner: Arc<CronRunner>,
    rate_limiter: Arc<RateLimitService>,
    logger: Arc<BufferedLogger>,
) -> Result<()> {
    info!("Starting message handlers...");

    let ping_sub = client.subscribe("offmarket.ping").await?;
    let cron_run_sub = client.subscribe("offmarket.cron.run").await?;

    info!("Subscribed to NATS subjects");

    let client_ping = client.clone();
    let rate_limiter_ping = Arc::clone(&rate_limiter);
    let ping_handle = tokio::spawn(async move {
        ping::handle_ping(client_ping, ping_sub, rate_limiter_ping).await
    });

    let client_cron = client.clone();
    let cron_run_handle = tokio::spawn(async move {
        cron::handle_run(client_cron, cron_run_sub, runner, rate_limiter, logger).await
    });

    info!("All handlers started, waiting for messages...");

    // Wait for any handler to finish (which means an error occurred)
    select! {
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = cron_run_handle => {
            error!("Cron run handler finished: {:?}", result);
        }
    }

    Ok(())
}
