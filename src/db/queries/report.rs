//! Report generation queries

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::CompanyRecord;

/// Companies enriched within the last 24 hours that have no report yet.
pub async fn list_companies_needing_report(pool: &PgPool, limit: i64) -> Result<Vec<CompanyRecord>> {
    let rows = sqlx::query_as::<_, CompanyRecord>(
        r#"
        SELECT c.id, c.name, c.domain, c.place_id, c.enriched_at, c.created_at
        FROM companies c
        WHERE c.enriched_at > NOW() - INTERVAL '24 hours'
          AND NOT EXISTS (
              SELECT 1 FROM company_reports r WHERE r.company_id = c.id
          )
        ORDER BY c.enriched_at
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Record that a report was requested for a company.
pub async fn record_report_requested(pool: &PgPool, company_id: Uuid) -> Result<()> {
    sqlx::query("INSERT INTO company_reports (company_id) VALUES ($1)")
        .bind(company_id)
        .execute(pool)
        .await?;

    Ok(())
}
