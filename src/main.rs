//! Off-Market Tool Worker - backend service for enrichment, outreach and
//! maintenance jobs.
//!
//! This worker connects to NATS and handles messages from the frontend
//! gateway; an hourly scheduler runs the job sweeps on its own.

mod cli;
mod config;
mod db;
mod handlers;
mod services;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use services::cron::{CronJob, CronRunner};
use services::enrichment::{
    EdgeConfig, EnrichmentClient, HttpEnrichmentClient, LogEnrichmentClient,
};
use services::logger::{BufferedLogger, LoggerConfig, PgLogSink, WebhookAlertSink};
use services::rate_limit::RateLimitService;

const SCHEDULE_INTERVAL: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "./logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,offmarket_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let args = cli::Cli::parse();

    info!("Starting Off-Market Worker...");

    // Load configuration
    let config = config::Config::from_env()?;
    info!("Configuration loaded");

    // Connect to database
    let pool = db::create_pool(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    // Run migrations
    db::run_migrations(&pool).await?;
    info!("Database migrations complete");

    // Buffered application logger, persisted to app_logs
    let mut logger = BufferedLogger::new(
        LoggerConfig::from_env(),
        Arc::new(PgLogSink::new(pool.clone())),
    );
    if let Some(ref url) = config.alert_webhook_url {
        logger = logger.with_alert(Arc::new(WebhookAlertSink::new(url.clone())?));
        info!("Alert webhook configured");
    }
    let logger = Arc::new(logger);

    // Downstream client: real edge functions when configured, log-only otherwise
    let client: Arc<dyn EnrichmentClient> = match EdgeConfig::from_env() {
        Some(edge) => {
            info!("Using edge-function enrichment client");
            Arc::new(HttpEnrichmentClient::new(edge)?)
        }
        None => {
            info!("Edge functions not configured, using log-only enrichment client");
            Arc::new(LogEnrichmentClient)
        }
    };

    let runner = Arc::new(CronRunner::new(pool.clone(), client, Arc::clone(&logger)));

    // One-shot mode: run the named job, print the outcome and exit.
    if let Some(ref job_name) = args.job {
        let job = CronJob::parse(job_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown job '{}'", job_name))?;
        let result = run_one_shot(&runner, job).await;
        logger.flush_now().await;
        let outcome = result?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let flusher_handle = logger.spawn_flusher(shutdown.clone());

    let rate_limiter = Arc::new(RateLimitService::new(Arc::clone(&logger)));
    let sweeper_handle = rate_limiter.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone());

    let schedule_handle =
        services::cron::spawn_schedule(Arc::clone(&runner), SCHEDULE_INTERVAL, shutdown.clone());

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    // Serve until a handler dies or we get a shutdown signal.
    tokio::select! {
        result = handlers::start_handlers(nats_client, runner, rate_limiter, Arc::clone(&logger)) => {
            if let Err(ref e) = result {
                error!("Handler error: {}", e);
            }
            shutdown.cancel();
            let _ = flusher_handle.await;
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            shutdown.cancel();
            // The flusher writes any remaining entries before exiting.
            let _ = flusher_handle.await;
            let _ = sweeper_handle.await;
            let _ = schedule_handle.await;
        }
    }

    info!("Off-Market Worker stopped");
    Ok(())
}

async fn run_one_shot(runner: &CronRunner, job: CronJob) -> Result<serde_json::Value> {
    let outcome = match job {
        CronJob::Enrichments => serde_json::to_value(runner.run_enrichments().await?)?,
        CronJob::Emails => serde_json::to_value(runner.run_emails().await?)?,
        CronJob::Maintenance => serde_json::to_value(runner.run_maintenance().await?)?,
        CronJob::Reports => serde_json::to_value(runner.run_reports().await?)?,
        CronJob::All => serde_json::to_value(runner.run_all().await)?,
    };
    Ok(outcome)
}
