use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::{LeaseLockStore, Result};

/// Lease lock backed by the `lease_lock` table.
///
/// Acquisition is a single upsert: the row is taken over only when its lease
/// ran out or the caller already owns it, so concurrent callers cannot both win.
#[derive(Clone)]
pub struct PostgresLeaseLock {
    pool: PgPool,
}

impl PostgresLeaseLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseLockStore for PostgresLeaseLock {
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lease_lock (name, token, locked_at, unlock_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                token = EXCLUDED.token,
                locked_at = EXCLUDED.locked_at,
                unlock_at = EXCLUDED.unlock_at
            WHERE lease_lock.unlock_at <= EXCLUDED.locked_at
               OR lease_lock.token = EXCLUDED.token
            "#,
        )
        .bind(name)
        .bind(token)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        if !acquired {
            tracing::debug!(lock = %name, "Lease lock held by another owner");
        }
        Ok(acquired)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM lease_lock WHERE name = $1 AND token = $2")
            .bind(name)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
