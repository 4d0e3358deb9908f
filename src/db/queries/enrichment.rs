//! Enrichment queue queries

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::EnrichmentRow;

/// Fetch the oldest pending enrichments, joined with their companies.
/// `limit` caps the sweep batch so a single run cannot monopolize
/// downstream provider quotas.
pub async fn list_pending(pool: &PgPool, limit: i64) -> Result<Vec<EnrichmentRow>> {
    let rows = sqlx::query_as::<_, EnrichmentRow>(
        r#"
        SELECT
            e.id, e.company_id, c.name AS company_name, c.domain AS company_domain,
            e.provider, e.attempts, e.created_at
        FROM enrichments e
        JOIN companies c ON c.id = e.company_id
        WHERE e.status = 'pending'
        ORDER BY e.created_at
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Mark an enrichment completed and stamp the company's enriched_at.
pub async fn mark_completed(pool: &PgPool, id: Uuid, company_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE enrichments
        SET status = 'completed', attempts = attempts + 1, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE companies SET enriched_at = NOW(), updated_at = NOW() WHERE id = $1")
        .bind(company_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Mark an enrichment failed, recording the error for later inspection.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE enrichments
        SET status = 'failed', attempts = attempts + 1, last_error = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}
