//! External enrichment/report/email client abstraction.
//!
//! `EnrichmentClient` is the core trait; the cron sweeps only ever talk to
//! it. `HttpEnrichmentClient` calls the platform's edge functions in
//! production, `LogEnrichmentClient` logs to tracing in dev/staging, and
//! `FakeEnrichmentClient` captures calls for tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Campaign, CompanyRecord, EnrichmentRow};

/// Transient failures are retried this many times before surfacing.
const RETRY_ATTEMPTS: u32 = 3;
/// Linear backoff step between retry attempts.
const RETRY_STEP: Duration = Duration::from_millis(500);

const ENRICH_TIMEOUT: Duration = Duration::from_secs(30);
const EMAIL_TIMEOUT: Duration = Duration::from_secs(30);
const REPORT_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Core trait
// =============================================================================

/// Abstraction over the downstream enrichment/report/email services.
#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    /// Enrich one company via the configured provider.
    async fn enrich_company(&self, enrichment: &EnrichmentRow) -> Result<()>;

    /// Dispatch one scheduled campaign batch. Returns emails sent.
    async fn send_campaign(&self, campaign: &Campaign) -> Result<u32>;

    /// Kick off report generation for a company.
    async fn generate_report(&self, company: &CompanyRecord) -> Result<()>;
}

// =============================================================================
// HttpEnrichmentClient - edge functions (production)
// =============================================================================

/// Connection details for the edge-function deployment.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub base_url: String,
    pub service_key: String,
}

impl EdgeConfig {
    /// Create config from environment variables. Returns `None` when the
    /// deployment is not configured (dev/staging).
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("EDGE_FUNCTIONS_URL").ok()?;
        let service_key = std::env::var("EDGE_SERVICE_KEY").ok()?;
        Some(Self {
            base_url,
            service_key,
        })
    }
}

pub struct HttpEnrichmentClient {
    client: reqwest::Client,
    config: EdgeConfig,
}

#[derive(Serialize)]
struct EnrichPayload<'a> {
    enrichment_id: Uuid,
    company_id: Uuid,
    company_name: &'a str,
    company_domain: Option<&'a str>,
    provider: &'a str,
}

#[derive(Serialize)]
struct CampaignPayload<'a> {
    campaign_id: Uuid,
    name: &'a str,
}

#[derive(Serialize)]
struct ReportPayload<'a> {
    company_id: Uuid,
    company_name: &'a str,
}

impl HttpEnrichmentClient {
    pub fn new(config: EdgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("offmarket-worker/0.3")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    /// POST to one edge function with a per-call timeout, retrying transient
    /// failures with linear backoff. A timed-out call counts as a failure of
    /// that attempt, never a crash.
    async fn post_with_retry<T: Serialize>(
        &self,
        function: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), function);
        let mut last_error = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.service_key)
                .timeout(timeout)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(anyhow::anyhow!(
                        "{} returned {}",
                        function,
                        response.status()
                    ));
                }
                Ok(response) => {
                    // Client errors are not transient; surface immediately.
                    anyhow::bail!("{} returned {}", function, response.status());
                }
                Err(e) => last_error = Some(e.into()),
            }

            if attempt < RETRY_ATTEMPTS {
                warn!(
                    "Edge call {} failed (attempt {}/{}), retrying",
                    function, attempt, RETRY_ATTEMPTS
                );
                tokio::time::sleep(RETRY_STEP * attempt).await;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{} failed", function)))
    }
}

#[async_trait]
impl EnrichmentClient for HttpEnrichmentClient {
    async fn enrich_company(&self, enrichment: &EnrichmentRow) -> Result<()> {
        let payload = EnrichPayload {
            enrichment_id: enrichment.id,
            company_id: enrichment.company_id,
            company_name: &enrichment.company_name,
            company_domain: enrichment.company_domain.as_deref(),
            provider: &enrichment.provider,
        };
        self.post_with_retry("enrich-company", &payload, ENRICH_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn send_campaign(&self, campaign: &Campaign) -> Result<u32> {
        let payload = CampaignPayload {
            campaign_id: campaign.id,
            name: &campaign.name,
        };
        let response = self
            .post_with_retry("send-campaign", &payload, EMAIL_TIMEOUT)
            .await?;

        #[derive(serde::Deserialize)]
        struct SentResponse {
            sent: u32,
        }
        let sent: SentResponse = response
            .json()
            .await
            .context("Invalid send-campaign response")?;
        Ok(sent.sent)
    }

    async fn generate_report(&self, company: &CompanyRecord) -> Result<()> {
        let payload = ReportPayload {
            company_id: company.id,
            company_name: &company.name,
        };
        self.post_with_retry("generate-report", &payload, REPORT_TIMEOUT)
            .await?;
        Ok(())
    }
}

// =============================================================================
// LogEnrichmentClient - writes to tracing (dev / staging)
// =============================================================================

pub struct LogEnrichmentClient;

#[async_trait]
impl EnrichmentClient for LogEnrichmentClient {
    async fn enrich_company(&self, enrichment: &EnrichmentRow) -> Result<()> {
        info!(
            company = %enrichment.company_name,
            provider = %enrichment.provider,
            "[LogEnrichmentClient] Would enrich company"
        );
        Ok(())
    }

    async fn send_campaign(&self, campaign: &Campaign) -> Result<u32> {
        info!(campaign = %campaign.name, "[LogEnrichmentClient] Would dispatch campaign");
        Ok(0)
    }

    async fn generate_report(&self, company: &CompanyRecord) -> Result<()> {
        info!(company = %company.name, "[LogEnrichmentClient] Would generate report");
        Ok(())
    }
}

// =============================================================================
// FakeEnrichmentClient - records calls, programmable failures (tests)
// =============================================================================

/// Captures calls in memory; ids in `failing` make the matching call error.
#[derive(Default)]
pub struct FakeEnrichmentClient {
    pub enriched: Mutex<Vec<Uuid>>,
    pub campaigns_sent: Mutex<Vec<Uuid>>,
    pub reports: Mutex<Vec<Uuid>>,
    failing: Mutex<HashSet<Uuid>>,
}

impl FakeEnrichmentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, id: Uuid) {
        self.failing.lock().unwrap().insert(id);
    }

    fn check(&self, id: Uuid) -> Result<()> {
        if self.failing.lock().unwrap().contains(&id) {
            anyhow::bail!("simulated downstream failure for {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl EnrichmentClient for FakeEnrichmentClient {
    async fn enrich_company(&self, enrichment: &EnrichmentRow) -> Result<()> {
        self.check(enrichment.id)?;
        self.enriched.lock().unwrap().push(enrichment.id);
        Ok(())
    }

    async fn send_campaign(&self, campaign: &Campaign) -> Result<u32> {
        self.check(campaign.id)?;
        self.campaigns_sent.lock().unwrap().push(campaign.id);
        Ok(5)
    }

    async fn generate_report(&self, company: &CompanyRecord) -> Result<()> {
        self.check(company.id)?;
        self.reports.lock().unwrap().push(company.id);
        Ok(())
    }
}
