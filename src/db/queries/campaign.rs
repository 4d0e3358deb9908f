//! Campaign scheduling queries

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::Campaign;

/// Active campaigns scheduled for the given weekday (0 = Sunday) and hour (UTC)
/// that have not already been dispatched within the last hour.
pub async fn list_due(pool: &PgPool, weekday: i32, hour: i32, limit: i64) -> Result<Vec<Campaign>> {
    let rows = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT id, name, scheduled_day, scheduled_hour, last_sent_at
        FROM campaigns
        WHERE active = TRUE
          AND scheduled_day = $1
          AND scheduled_hour = $2
          AND (last_sent_at IS NULL OR last_sent_at < NOW() - INTERVAL '1 hour')
        ORDER BY created_at
        LIMIT $3
        "#,
    )
    .bind(weekday)
    .bind(hour)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Stamp a campaign as dispatched.
pub async fn mark_sent(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE campaigns SET last_sent_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}
