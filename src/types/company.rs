//! Company, enrichment and campaign row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A saved business the platform tracks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub id: Uuid,
    pub name: String,
    pub domain: Option<String>,
    pub place_id: Option<String>,
    pub enriched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One pending enrichment attempt against a provider, joined with its company.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRow {
    pub id: Uuid,
    pub company_id: Uuid,
    pub company_name: String,
    pub company_domain: Option<String>,
    pub provider: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// A recurring outreach campaign, scheduled by weekday and hour (UTC).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub scheduled_day: i32,
    pub scheduled_hour: i32,
    pub last_sent_at: Option<DateTime<Utc>>,
}
