//! Durable backing for long-lived API responses.
//!
//! The in-memory API shard loses everything on restart; responses that
//! are expensive to refetch (series metadata in particular) are also
//! persisted by fingerprint with an absolute expiry. Lookups consult
//! this layer on memory miss before the caller falls through to the
//! network.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait DurableResponseStore: Send + Sync + fmt::Debug {
    /// Fetch a non-expired entry.
    async fn get(&self, fingerprint: &str) -> Result<Option<(Value, DateTime<Utc>)>>;

    /// Insert or replace; last write wins.
    async fn put(&self, fingerprint: &str, payload: &Value, expires_at: DateTime<Utc>)
    -> Result<()>;

    /// Drop expired rows; returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

#[derive(Clone)]
pub struct PostgresResponseStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresResponseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresResponseStore").finish()
    }
}

impl PostgresResponseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableResponseStore for PostgresResponseStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<(Value, DateTime<Utc>)>> {
        let row = sqlx::query(
            r#"
            SELECT payload, expires_at
            FROM api_response_cache
            WHERE fingerprint = $1 AND expires_at > NOW()
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: Value = row.try_get("payload")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        Ok(Some((payload, expires_at)))
    }

    async fn put(
        &self,
        fingerprint: &str,
        payload: &Value,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_response_cache (fingerprint, payload, expires_at, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (fingerprint) DO UPDATE SET
                payload = EXCLUDED.payload,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(fingerprint)
        .bind(payload)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM api_response_cache WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "purged expired durable cache rows");
        }
        Ok(purged)
    }
}
