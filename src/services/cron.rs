//! Periodic maintenance jobs.
//!
//! Each job sweeps a bounded batch of pending work sequentially, with a fixed
//! inter-item delay so downstream providers are not hammered. A failing item
//! is counted and logged, never allowed to abort its batch. `run_all`
//! executes the four jobs in a fixed order (they compete for the same
//! downstream quotas, so no parallelism) and aggregates the outcomes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Timelike, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::services::enrichment::EnrichmentClient;
use crate::services::logger::BufferedLogger;
use crate::types::{Campaign, CompanyRecord, EnrichmentRow, LogCategory};

/// Hard cap on items per sweep.
pub const DEFAULT_BATCH_SIZE: i64 = 10;
/// Pause between items within one sweep.
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_secs(1);
/// Persisted log rows older than this are purged by maintenance.
pub const LOG_RETENTION_DAYS: i32 = 90;

// =============================================================================
// Job identifiers and results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronJob {
    Enrichments,
    Emails,
    Maintenance,
    Reports,
    All,
}

impl CronJob {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enrichments" => Some(CronJob::Enrichments),
            "emails" => Some(CronJob::Emails),
            "maintenance" => Some(CronJob::Maintenance),
            "reports" => Some(CronJob::Reports),
            "all" => Some(CronJob::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CronJob::Enrichments => "enrichments",
            CronJob::Emails => "emails",
            CronJob::Maintenance => "maintenance",
            CronJob::Reports => "reports",
            CronJob::All => "all",
        }
    }
}

/// Aggregate result of one job sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub processed: u32,
    pub failed: u32,
    pub message: String,
}

impl JobOutcome {
    fn empty(message: impl Into<String>) -> Self {
        Self {
            processed: 0,
            failed: 0,
            message: message.into(),
        }
    }

    /// Outcome for a job whose batch could not even be fetched.
    fn batch_error(job: &str, error: &anyhow::Error) -> Self {
        Self::empty(format!("{} sweep failed: {}", job, error))
    }
}

/// Combined result of `run_all`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSummary {
    pub enrichments: JobOutcome,
    pub emails: JobOutcome,
    pub maintenance: JobOutcome,
    pub reports: JobOutcome,
    pub message: String,
}

// =============================================================================
// CronRunner
// =============================================================================

pub struct CronRunner {
    pool: PgPool,
    client: Arc<dyn EnrichmentClient>,
    logger: Arc<BufferedLogger>,
    batch_size: i64,
    item_delay: Duration,
}

impl CronRunner {
    pub fn new(pool: PgPool, client: Arc<dyn EnrichmentClient>, logger: Arc<BufferedLogger>) -> Self {
        Self {
            pool,
            client,
            logger,
            batch_size: DEFAULT_BATCH_SIZE,
            item_delay: DEFAULT_ITEM_DELAY,
        }
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one named job (or all of them) and return the JSON-serializable
    /// result.
    pub async fn run_job(&self, job: CronJob) -> serde_json::Value {
        match job {
            CronJob::Enrichments => outcome_json(self.run_enrichments().await, "enrichments"),
            CronJob::Emails => outcome_json(self.run_emails().await, "emails"),
            CronJob::Maintenance => outcome_json(self.run_maintenance().await, "maintenance"),
            CronJob::Reports => outcome_json(self.run_reports().await, "reports"),
            CronJob::All => {
                serde_json::to_value(self.run_all().await).unwrap_or_else(|_| serde_json::json!({}))
            }
        }
    }

    // ── Enrichment sweep ─────────────────────────────────────────────────

    pub async fn run_enrichments(&self) -> Result<JobOutcome> {
        let rows = db::queries::enrichment::list_pending(&self.pool, self.batch_size).await?;
        Ok(self.process_enrichments(rows).await)
    }

    pub(crate) async fn process_enrichments(&self, rows: Vec<EnrichmentRow>) -> JobOutcome {
        let started = std::time::Instant::now();
        let total = rows.len();
        let mut processed = 0;
        let mut failed = 0;

        for (i, row) in rows.into_iter().enumerate() {
            match self.client.enrich_company(&row).await {
                Ok(()) => {
                    processed += 1;
                    if let Err(e) =
                        db::queries::enrichment::mark_completed(&self.pool, row.id, row.company_id)
                            .await
                    {
                        self.logger.warn(
                            LogCategory::Database,
                            format!("Failed to mark enrichment {} completed", row.id),
                            Some(serde_json::json!({ "error": e.to_string() })),
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    self.logger.error(
                        LogCategory::ExternalApi,
                        format!("Enrichment failed for {} ({})", row.company_name, row.provider),
                        Some(serde_json::json!({
                            "enrichmentId": row.id,
                            "error": e.to_string(),
                        })),
                    );
                    let _ = db::queries::enrichment::mark_failed(&self.pool, row.id, &e.to_string())
                        .await;
                }
            }

            if i + 1 < total && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
        }

        let message = format!("Enriched {} companies, {} failed", processed, failed);
        self.finish_job("enrichment_sweep", &message, processed, failed, started);
        JobOutcome {
            processed,
            failed,
            message,
        }
    }

    // ── Campaign email sweep ─────────────────────────────────────────────

    pub async fn run_emails(&self) -> Result<JobOutcome> {
        let now = Utc::now();
        let weekday = now.weekday().num_days_from_sunday() as i32;
        let hour = now.hour() as i32;
        let campaigns =
            db::queries::campaign::list_due(&self.pool, weekday, hour, self.batch_size).await?;
        Ok(self.process_campaigns(campaigns).await)
    }

    pub(crate) async fn process_campaigns(&self, campaigns: Vec<Campaign>) -> JobOutcome {
        let started = std::time::Instant::now();
        let total = campaigns.len();
        let mut processed = 0;
        let mut failed = 0;
        let mut emails_sent: u32 = 0;

        for (i, campaign) in campaigns.into_iter().enumerate() {
            match self.client.send_campaign(&campaign).await {
                Ok(sent) => {
                    processed += 1;
                    emails_sent += sent;
                    if let Err(e) = db::queries::campaign::mark_sent(&self.pool, campaign.id).await
                    {
                        self.logger.warn(
                            LogCategory::Database,
                            format!("Failed to mark campaign {} sent", campaign.id),
                            Some(serde_json::json!({ "error": e.to_string() })),
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    self.logger.error(
                        LogCategory::ExternalApi,
                        format!("Campaign dispatch failed for '{}'", campaign.name),
                        Some(serde_json::json!({
                            "campaignId": campaign.id,
                            "error": e.to_string(),
                        })),
                    );
                }
            }

            if i + 1 < total && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
        }

        let message = format!(
            "Dispatched {} campaigns ({} emails), {} failed",
            processed, emails_sent, failed
        );
        self.finish_job("email_sweep", &message, processed, failed, started);
        JobOutcome {
            processed,
            failed,
            message,
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Data retention: expired invitations and old persisted logs.
    pub async fn run_maintenance(&self) -> Result<JobOutcome> {
        let started = std::time::Instant::now();
        let mut failed = 0;

        let invitations = match db::queries::maintenance::delete_expired_invitations(&self.pool)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                failed += 1;
                self.logger.error(
                    LogCategory::Database,
                    "Failed to delete expired invitations",
                    Some(serde_json::json!({ "error": e.to_string() })),
                );
                0
            }
        };

        let logs = match db::queries::maintenance::purge_old_logs(&self.pool, LOG_RETENTION_DAYS)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                failed += 1;
                self.logger.error(
                    LogCategory::Database,
                    "Failed to purge old logs",
                    Some(serde_json::json!({ "error": e.to_string() })),
                );
                0
            }
        };

        let processed = (invitations + logs) as u32;
        let message = format!(
            "Removed {} expired invitations, purged {} log rows",
            invitations, logs
        );
        self.finish_job("maintenance_sweep", &message, processed, failed, started);
        Ok(JobOutcome {
            processed,
            failed,
            message,
        })
    }

    // ── Report sweep ─────────────────────────────────────────────────────

    pub async fn run_reports(&self) -> Result<JobOutcome> {
        let companies =
            db::queries::report::list_companies_needing_report(&self.pool, self.batch_size).await?;
        Ok(self.process_reports(companies).await)
    }

    pub(crate) async fn process_reports(&self, companies: Vec<CompanyRecord>) -> JobOutcome {
        let started = std::time::Instant::now();
        let total = companies.len();
        let mut processed = 0;
        let mut failed = 0;

        for (i, company) in companies.into_iter().enumerate() {
            match self.client.generate_report(&company).await {
                Ok(()) => {
                    processed += 1;
                    if let Err(e) =
                        db::queries::report::record_report_requested(&self.pool, company.id).await
                    {
                        self.logger.warn(
                            LogCategory::Database,
                            format!("Failed to record report for company {}", company.id),
                            Some(serde_json::json!({ "error": e.to_string() })),
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    self.logger.error(
                        LogCategory::ExternalApi,
                        format!("Report generation failed for '{}'", company.name),
                        Some(serde_json::json!({
                            "companyId": company.id,
                            "error": e.to_string(),
                        })),
                    );
                }
            }

            if i + 1 < total && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
        }

        let message = format!("Requested {} reports, {} failed", processed, failed);
        self.finish_job("report_sweep", &message, processed, failed, started);
        JobOutcome {
            processed,
            failed,
            message,
        }
    }

    // ── Batch run ────────────────────────────────────────────────────────

    /// Run every job in a fixed sequence. Jobs share downstream quotas, so
    /// they are never parallelized. A sub-job whose batch fails entirely
    /// still yields a well-formed outcome.
    pub async fn run_all(&self) -> CronSummary {
        let enrichments = self
            .run_enrichments()
            .await
            .unwrap_or_else(|e| self.failed_job("enrichments", e));
        let emails = self
            .run_emails()
            .await
            .unwrap_or_else(|e| self.failed_job("emails", e));
        let maintenance = self
            .run_maintenance()
            .await
            .unwrap_or_else(|e| self.failed_job("maintenance", e));
        let reports = self
            .run_reports()
            .await
            .unwrap_or_else(|e| self.failed_job("reports", e));

        let message = format!(
            "enrichments: {} | emails: {} | maintenance: {} | reports: {}",
            enrichments.message, emails.message, maintenance.message, reports.message
        );
        self.logger
            .info(LogCategory::CronJob, format!("Cron batch complete: {}", message), None);

        CronSummary {
            enrichments,
            emails,
            maintenance,
            reports,
            message,
        }
    }

    fn failed_job(&self, job: &str, error: anyhow::Error) -> JobOutcome {
        self.logger.error(
            LogCategory::CronJob,
            format!("Cron job '{}' failed before processing any items", job),
            Some(serde_json::json!({ "error": error.to_string() })),
        );
        JobOutcome::batch_error(job, &error)
    }

    fn finish_job(
        &self,
        operation: &str,
        message: &str,
        processed: u32,
        failed: u32,
        started: std::time::Instant,
    ) {
        self.logger.performance(
            LogCategory::CronJob,
            operation,
            started.elapsed().as_millis() as u64,
            Some(serde_json::json!({
                "processed": processed,
                "failed": failed,
                "message": message,
            })),
        );
    }
}

fn outcome_json(result: Result<JobOutcome>, job: &str) -> serde_json::Value {
    let outcome = result.unwrap_or_else(|e| JobOutcome::batch_error(job, &e));
    serde_json::to_value(outcome).unwrap_or_else(|_| serde_json::json!({}))
}

/// Spawn the recurring batch schedule; cancelled on shutdown.
pub fn spawn_schedule(
    runner: Arc<CronRunner>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = runner.run_all().await;
                }
                _ = token.cancelled() => break,
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
