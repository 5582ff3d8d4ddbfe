//! PostgreSQL transfer archive

use super::TransactionArchive;
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::transfer::{BridgeTransaction, Chain, TransferStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// Archive of transfer records in PostgreSQL
pub struct PgArchive {
    pool: PgPool,
}

impl PgArchive {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if missing
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transactions (
                id TEXT PRIMARY KEY,
                source_chain VARCHAR(16) NOT NULL,
                target_chain VARCHAR(16) NOT NULL,
                source_address TEXT NOT NULL,
                target_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT,
                status VARCHAR(16) NOT NULL,
                status_rank SMALLINT NOT NULL,
                source_tx_ref TEXT,
                target_tx_ref TEXT,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_transactions_active
            ON bridge_transactions (status_rank, created_at)
            WHERE status_rank < 2
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain VARCHAR(16) PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

const TRANSACTION_COLUMNS: &str = "id, source_chain, target_chain, source_address, target_address, \
     amount, fee, status, source_tx_ref, target_tx_ref, error_message, created_at";

#[async_trait]
impl TransactionArchive for PgArchive {
    async fn upsert(&self, tx: &BridgeTransaction) -> BridgeResult<()> {
        // The rank guard keeps an out-of-order write from moving a record backward
        sqlx::query(
            r#"
            INSERT INTO bridge_transactions (
                id, source_chain, target_chain, source_address, target_address,
                amount, fee, status, status_rank, source_tx_ref, target_tx_ref,
                error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (id) DO UPDATE SET
                fee = EXCLUDED.fee,
                status = EXCLUDED.status,
                status_rank = EXCLUDED.status_rank,
                target_tx_ref = COALESCE(EXCLUDED.target_tx_ref, bridge_transactions.target_tx_ref),
                error_message = EXCLUDED.error_message,
                updated_at = NOW()
            WHERE bridge_transactions.status_rank < EXCLUDED.status_rank
               OR bridge_transactions.status = EXCLUDED.status
            "#,
        )
        .bind(&tx.id)
        .bind(tx.source_chain.as_str())
        .bind(tx.target_chain.as_str())
        .bind(&tx.source_address)
        .bind(&tx.target_address)
        .bind(&tx.amount)
        .bind(&tx.fee)
        .bind(tx.status.as_str())
        .bind(tx.status.rank())
        .bind(&tx.source_tx_ref)
        .bind(&tx.target_tx_ref)
        .bind(&tx.error_message)
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Archived transfer {} as {}", tx.id, tx.status);
        Ok(())
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<BridgeTransaction>> {
        let query = format!(
            "SELECT {} FROM bridge_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn load_active(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        let query = format!(
            "SELECT {} FROM bridge_transactions WHERE status_rank < 2 ORDER BY created_at",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain)
            DO UPDATE SET block_number = GREATEST(chain_checkpoints.block_number, $2),
                          updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(height as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: block {}", chain, height);
        Ok(())
    }

    async fn get_checkpoint(&self, chain: Chain) -> BridgeResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE chain = $1")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }
}

fn row_to_transaction(row: &PgRow) -> BridgeResult<BridgeTransaction> {
    let id: String = row.try_get("id")?;
    let source_chain: String = row.try_get("source_chain")?;
    let target_chain: String = row.try_get("target_chain")?;
    let status: String = row.try_get("status")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    let corrupt = |field: &str, value: &str| {
        BridgeError::Internal(format!("archived transfer {} has invalid {} {:?}", id, field, value))
    };

    Ok(BridgeTransaction {
        source_chain: Chain::parse(&source_chain)
            .ok_or_else(|| corrupt("source_chain", &source_chain))?,
        target_chain: Chain::parse(&target_chain)
            .ok_or_else(|| corrupt("target_chain", &target_chain))?,
        status: TransferStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        source_address: row.try_get("source_address")?,
        target_address: row.try_get("target_address")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        source_tx_ref: row.try_get("source_tx_ref")?,
        target_tx_ref: row.try_get("target_tx_ref")?,
        error_message: row.try_get("error_message")?,
        created_at,
        id,
    })
}
