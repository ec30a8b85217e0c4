//! Ledger store
//!
//! Insert-only record of every finalized intent, keyed by `from_tx_hash`.
//! The executor checks `exists` before doing any work and writes exactly one
//! row per source transaction; the unique index makes a racing second
//! insert a no-op.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::RwLock;
use tracing::{error, warn};

pub mod models;

pub use models::*;

use crate::types::BridgeIntent;

/// Durable store of finalized intents
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Whether an intent with this source hash was already finalized
    async fn exists(&self, from_tx_hash: &str) -> Result<bool>;

    /// Persist a finalized intent. Returns `false` if a row with the same
    /// `from_tx_hash` already existed and nothing was written.
    async fn insert(&self, intent: &BridgeIntent) -> Result<bool>;

    /// Every persisted intent, oldest first
    async fn list_all(&self) -> Result<Vec<BridgeIntent>>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// PostgreSQL-backed ledger
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn amount_text(amount: &Option<bigdecimal::BigDecimal>) -> Option<String> {
    amount.as_ref().map(|a| a.to_string())
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn exists(&self, from_tx_hash: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (bool,)>(
            "SELECT EXISTS(SELECT 1 FROM bridge_intents WHERE from_tx_hash = $1)",
        )
        .bind(from_tx_hash)
        .fetch_one(&self.pool)
        .await
        .wrap_err("Failed to check intent existence")?;

        Ok(row.0)
    }

    async fn insert(&self, intent: &BridgeIntent) -> Result<bool> {
        let status = match intent.tx_status {
            Some(status) => status,
            None => eyre::bail!("refusing to persist intent {} without a status", intent.from_tx_hash),
        };

        // Amounts are cast from text so that no precision is lost
        let result = sqlx::query(
            r#"
            INSERT INTO bridge_intents (from_network, from_address, from_asset_code,
                from_asset_issuer, from_amount, from_tx_hash, to_network, to_address,
                to_asset_code, to_asset_issuer, to_amount, to_tx_hash, tx_status, tx_fee)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, $9, $10, $11::NUMERIC, $12, $13, $14::NUMERIC)
            ON CONFLICT (from_tx_hash) DO NOTHING
            "#,
        )
        .bind(intent.from_network.as_str())
        .bind(&intent.from_address)
        .bind(&intent.from_asset_code)
        .bind(&intent.from_asset_issuer)
        .bind(amount_text(&intent.from_amount))
        .bind(&intent.from_tx_hash)
        .bind(intent.to_network.map(|n| n.as_str()))
        .bind(&intent.to_address)
        .bind(&intent.to_asset_code)
        .bind(&intent.to_asset_issuer)
        .bind(amount_text(&intent.to_amount))
        .bind(&intent.to_tx_hash)
        .bind(status.as_str())
        .bind(amount_text(&intent.tx_fee))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(tx_hash = %intent.from_tx_hash, "SQL error inserting intent: {:?}", e);
            e
        })
        .wrap_err("Failed to insert intent")?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            warn!(tx_hash = %intent.from_tx_hash, "Intent already in ledger, insert skipped");
        }
        Ok(inserted)
    }

    async fn list_all(&self) -> Result<Vec<BridgeIntent>> {
        let rows = sqlx::query_as::<_, IntentRow>(
            r#"SELECT id, from_network, from_address, from_asset_code, from_asset_issuer,
                      from_amount::TEXT as from_amount, from_tx_hash, to_network, to_address,
                      to_asset_code, to_asset_issuer, to_amount::TEXT as to_amount, to_tx_hash,
                      tx_status, tx_fee::TEXT as tx_fee, created_at
               FROM bridge_intents ORDER BY id ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list intents")?;

        rows.into_iter().map(BridgeIntent::try_from).collect()
    }
}

/// In-process ledger used by tests and local dry runs
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<Vec<BridgeIntent>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn get(&self, from_tx_hash: &str) -> Option<BridgeIntent> {
        self.rows
            .read()
            .await
            .iter()
            .find(|i| i.from_tx_hash == from_tx_hash)
            .cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn exists(&self, from_tx_hash: &str) -> Result<bool> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .any(|i| i.from_tx_hash == from_tx_hash))
    }

    async fn insert(&self, intent: &BridgeIntent) -> Result<bool> {
        if intent.tx_status.is_none() {
            eyre::bail!("refusing to persist intent {} without a status", intent.from_tx_hash);
        }
        let mut rows = self.rows.write().await;
        if rows.iter().any(|i| i.from_tx_hash == intent.from_tx_hash) {
            return Ok(false);
        }
        rows.push(intent.clone());
        Ok(true)
    }

    async fn list_all(&self) -> Result<Vec<BridgeIntent>> {
        Ok(self.rows.read().await.clone())
    }
}
