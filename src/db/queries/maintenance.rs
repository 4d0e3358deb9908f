//! Data-retention queries used by the maintenance sweep

use anyhow::Result;
use sqlx::PgPool;

/// Delete invitations whose expiry has passed. Returns the number removed.
pub async fn delete_expired_invitations(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM invitations WHERE expires_at < NOW()")
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Purge persisted log rows older than `retention_days`. Returns the number removed.
pub async fn purge_old_logs(pool: &PgPool, retention_days: i32) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM app_logs WHERE created_at < NOW() - make_interval(days => $1)",
    )
    .bind(retention_days)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
