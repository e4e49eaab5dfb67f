//! Journal store access.
//!
//! The relational store is the only shared mutable resource across
//! concurrent syncs. This module wraps the handful of read/write operations
//! the engine needs: account status/credentials on the accounts table, and
//! idempotent trade-row writes keyed by (account id, ticket).

mod accounts;
mod trades;

pub use accounts::{AccountStore, BrokerAccount};
pub use trades::TradeStore;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database connection error.
    #[error("database connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Query(err.to_string())
    }
}

/// Open a connection pool against the journal's SQLite database.
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    info!("store connection pool initialized");
    Ok(pool)
}

#[cfg(test)]
pub(crate) mod tests {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// Minimal slice of the journal schema the engine touches.
    pub(crate) const TEST_SCHEMA: &str = r"
        CREATE TABLE accounts (
            id INTEGER PRIMARY KEY,
            type VARCHAR(20) DEFAULT 'local',
            ctrader_account_id VARCHAR(100),
            ctrader_token TEXT,
            ctrader_client_id VARCHAR(100),
            ctrader_client_secret TEXT,
            ctrader_env VARCHAR(20),
            sync_status VARCHAR(60) DEFAULT 'idle',
            last_sync_error TEXT,
            last_synced_at DATETIME,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            symbol VARCHAR(20) NOT NULL,
            side VARCHAR(10) NOT NULL,
            entry_price REAL,
            exit_price REAL,
            lot_size REAL,
            pnl REAL,
            entry_time DATETIME,
            exit_time DATETIME,
            trade_type VARCHAR(20) DEFAULT 'actual',
            notes TEXT,
            ticket VARCHAR(50),
            initial_sl REAL,
            exit_sl REAL,
            bullet_size REAL,
            rr_ratio REAL,
            sl_history TEXT
        );
    ";

    /// In-memory pool with the test schema applied. A single connection
    /// keeps every query on the same in-memory database.
    pub(crate) async fn make_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(TEST_SCHEMA).execute(&pool).await.unwrap();
        pool
    }

    pub(crate) async fn insert_broker_account(
        pool: &SqlitePool,
        id: i64,
        venue_account_id: &str,
        env: &str,
    ) {
        sqlx::query(
            r"
            INSERT INTO accounts (id, type, ctrader_account_id, ctrader_token,
                                  ctrader_client_id, ctrader_client_secret,
                                  ctrader_env, sync_status)
            VALUES (?, 'ctrader', ?, 'token', 'client', 'secret', ?, 'idle')
            ",
        )
        .bind(id)
        .bind(venue_account_id)
        .bind(env)
        .execute(pool)
        .await
        .unwrap();
    }
}
