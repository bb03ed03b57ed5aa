//! PostgreSQL swap store

use super::{StoreError, SwapStatus, SwapStore};
use crate::config::DatabaseConfig;
use crate::script::{Secret, SecretHash};
use crate::OrderId;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// Swap store keeping one `swaps` row per order
pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist yet
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                order_id BYTEA PRIMARY KEY,
                status VARCHAR(32) NOT NULL DEFAULT 'info_submitted',
                expiry BIGINT,
                secret_hash BYTEA,
                secret BYTEA,
                atom_details BYTEA,
                foreign_details BYTEA,
                redeemable BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_redeemable
            ON swaps (order_id) WHERE redeemable
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Selected `columns` of the order's row, if any
    async fn fetch(&self, order_id: &OrderId, columns: &str) -> Result<Option<PgRow>, StoreError> {
        let sql = format!("SELECT {} FROM swaps WHERE order_id = $1", columns);
        Ok(sqlx::query(&sql)
            .bind(order_id.as_slice())
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Nullable BYTEA column, `Missing` when the row or value is absent
    async fn bytes(&self, order_id: &OrderId, column: &'static str) -> Result<Vec<u8>, StoreError> {
        let row = self.fetch(order_id, column).await?;
        row.map(|row| row.try_get::<Option<Vec<u8>>, _>(column))
            .transpose()?
            .flatten()
            .ok_or_else(|| StoreError::missing(order_id, column))
    }

    /// Upsert one BYTEA column
    async fn put_bytes(
        &self,
        order_id: &OrderId,
        column: &'static str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO swaps (order_id, {col})
            VALUES ($1, $2)
            ON CONFLICT (order_id) DO UPDATE SET
                {col} = EXCLUDED.{col},
                updated_at = NOW()
            "#,
            col = column
        );
        sqlx::query(&sql)
            .bind(order_id.as_slice())
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upsert the redeemable marker
    async fn set_redeemable(&self, order_id: &OrderId, redeemable: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swaps (order_id, redeemable)
            VALUES ($1, $2)
            ON CONFLICT (order_id) DO UPDATE SET
                redeemable = EXCLUDED.redeemable,
                updated_at = NOW()
            "#,
        )
        .bind(order_id.as_slice())
        .bind(redeemable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Fixed-width column value, `Corrupt` on any other length
fn to_array(order_id: &OrderId, field: &str, bytes: Vec<u8>) -> Result<[u8; 32], StoreError> {
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        StoreError::Corrupt(format!(
            "{} of order {} is {} bytes",
            field,
            crate::order_tag(order_id),
            bytes.len()
        ))
    })
}

#[async_trait]
impl SwapStore for PgSwapStore {
    /// Get the order's status
    async fn status(&self, order_id: &OrderId) -> Result<SwapStatus, StoreError> {
        match self.fetch(order_id, "status").await? {
            Some(row) => row.try_get::<String, _>("status")?.parse(),
            None => Ok(SwapStatus::default()),
        }
    }

    /// Update the order's status
    async fn put_status(&self, order_id: &OrderId, status: SwapStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swaps (order_id, status)
            VALUES ($1, $2)
            ON CONFLICT (order_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(order_id.as_slice())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        debug!("[{}] Stored status {}", crate::order_tag(order_id), status);
        Ok(())
    }

    /// Store expiry and secret hash in one statement
    async fn put_initiate_details(
        &self,
        order_id: &OrderId,
        expiry: i64,
        secret_hash: SecretHash,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swaps (order_id, expiry, secret_hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id) DO UPDATE SET
                expiry = EXCLUDED.expiry,
                secret_hash = EXCLUDED.secret_hash,
                updated_at = NOW()
            "#,
        )
        .bind(order_id.as_slice())
        .bind(expiry)
        .bind(secret_hash.as_slice())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get expiry and secret hash; both must be set
    async fn initiate_details(&self, order_id: &OrderId) -> Result<(i64, SecretHash), StoreError> {
        let row = self
            .fetch(order_id, "expiry, secret_hash")
            .await?
            .ok_or_else(|| StoreError::missing(order_id, "initiate details"))?;

        let expiry: Option<i64> = row.try_get("expiry")?;
        let secret_hash: Option<Vec<u8>> = row.try_get("secret_hash")?;
        match (expiry, secret_hash) {
            (Some(expiry), Some(hash)) => Ok((expiry, to_array(order_id, "secret hash", hash)?)),
            _ => Err(StoreError::missing(order_id, "initiate details")),
        }
    }

    /// Store the secret
    async fn put_redeem_details(&self, order_id: &OrderId, secret: &Secret) -> Result<(), StoreError> {
        self.put_bytes(order_id, "secret", secret.as_bytes()).await
    }

    /// Get the secret
    async fn redeem_details(&self, order_id: &OrderId) -> Result<Secret, StoreError> {
        let bytes = self.bytes(order_id, "secret").await?;
        Ok(Secret::from_bytes(to_array(order_id, "secret", bytes)?))
    }

    /// Store this side's contract details
    async fn put_atom_details(&self, order_id: &OrderId, details: &[u8]) -> Result<(), StoreError> {
        self.put_bytes(order_id, "atom_details", details).await
    }

    /// Get this side's contract details
    async fn atom_details(&self, order_id: &OrderId) -> Result<Vec<u8>, StoreError> {
        self.bytes(order_id, "atom_details").await
    }

    /// Store the counterparty's contract details
    async fn put_foreign_details(
        &self,
        order_id: &OrderId,
        details: &[u8],
    ) -> Result<(), StoreError> {
        self.put_bytes(order_id, "foreign_details", details).await
    }

    /// Get the counterparty's contract details
    async fn foreign_details(&self, order_id: &OrderId) -> Result<Vec<u8>, StoreError> {
        self.bytes(order_id, "foreign_details").await
    }

    /// Mark the order for the redeem sweep
    async fn put_redeemable(&self, order_id: &OrderId) -> Result<(), StoreError> {
        self.set_redeemable(order_id, true).await
    }

    /// Take the order off the redeem sweep
    async fn redeemed(&self, order_id: &OrderId) -> Result<(), StoreError> {
        self.set_redeemable(order_id, false).await
    }

    /// Orders due for the redeem sweep, oldest first
    async fn redeemable_orders(&self) -> Result<Vec<OrderId>, StoreError> {
        let rows = sqlx::query("SELECT order_id FROM swaps WHERE redeemable ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let bytes: Vec<u8> = row.try_get("order_id")?;
                bytes
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("order id is not 32 bytes".to_string()))
            })
            .collect()
    }

    /// Check database connectivity
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
