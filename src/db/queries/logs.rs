//! Persistent log sink queries

use anyhow::Result;
use sqlx::PgPool;

use crate::types::LogEntry;

/// Insert a batch of buffered log entries in a single statement.
pub async fn insert_batch(pool: &PgPool, entries: &[LogEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut builder = sqlx::QueryBuilder::new(
        "INSERT INTO app_logs (level, category, message, metadata, user_id, \
         session_id, request_id, component, duration_ms, error, tags, created_at) ",
    );

    builder.push_values(entries, |mut row, entry| {
        row.push_bind(entry.level.as_str())
            .push_bind(entry.category.as_str())
            .push_bind(&entry.message)
            .push_bind(&entry.metadata)
            .push_bind(&entry.user_id)
            .push_bind(&entry.session_id)
            .push_bind(&entry.request_id)
            .push_bind(&entry.component)
            .push_bind(entry.duration_ms.map(|d| d as i64))
            .push_bind(&entry.error)
            .push_bind(&entry.tags)
            .push_bind(entry.timestamp);
    });

    builder.build().execute(pool).await?;

    Ok(())
}
