//! Accounts table access: broker-linked account discovery and the
//! sync-status/last-error fields that form the engine's only observable
//! failure surface.

use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::StoreError;
use crate::config::VenueEnvironment;

/// One broker-linked account row.
#[derive(Debug, Clone)]
pub struct BrokerAccount {
    /// Journal account id.
    pub id: i64,
    /// Venue-side trading account id.
    pub venue_account_id: i64,
    /// Account-level access token.
    pub access_token: String,
    /// Application client id.
    pub client_id: String,
    /// Application client secret.
    pub client_secret: String,
    /// Venue environment.
    pub environment: VenueEnvironment,
    /// Current sync status string.
    pub sync_status: String,
}

impl BrokerAccount {
    /// Whether a manual resync is currently running for this account.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.sync_status.starts_with("syncing")
    }
}

/// Accounts table operations.
#[derive(Debug, Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch one broker-linked account by id.
    pub async fn broker_account(&self, account_id: i64) -> Result<Option<BrokerAccount>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT id, ctrader_account_id, ctrader_token, ctrader_client_id,
                   ctrader_client_secret, ctrader_env, sync_status
            FROM accounts
            WHERE id = ? AND type = 'ctrader' AND ctrader_token != ''
            ",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| Self::row_to_account(&r)))
    }

    /// All broker-linked accounts that carry credentials.
    pub async fn broker_linked(&self) -> Result<Vec<BrokerAccount>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, ctrader_account_id, ctrader_token, ctrader_client_id,
                   ctrader_client_secret, ctrader_env, sync_status
            FROM accounts
            WHERE type = 'ctrader' AND ctrader_token != ''
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(Self::row_to_account).collect())
    }

    fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Option<BrokerAccount> {
        let id: i64 = row.try_get("id").ok()?;
        let venue_account_raw: String = row.try_get("ctrader_account_id").unwrap_or_default();
        let Ok(venue_account_id) = venue_account_raw.parse::<i64>() else {
            warn!(
                account_id = id,
                venue_account = %venue_account_raw,
                "unparseable venue account id, skipping"
            );
            return None;
        };

        Some(BrokerAccount {
            id,
            venue_account_id,
            access_token: row.try_get("ctrader_token").unwrap_or_default(),
            client_id: row.try_get("ctrader_client_id").unwrap_or_default(),
            client_secret: row.try_get("ctrader_client_secret").unwrap_or_default(),
            environment: VenueEnvironment::from_str_case_insensitive(
                &row.try_get::<String, _>("ctrader_env").unwrap_or_default(),
            ),
            sync_status: row.try_get("sync_status").unwrap_or_default(),
        })
    }

    /// Update the account's progress status string.
    pub async fn set_status(&self, account_id: i64, status: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE accounts SET sync_status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a sync as started, clearing any previous error.
    pub async fn mark_preparing(&self, account_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE accounts
            SET sync_status = 'syncing (preparing)...', last_sync_error = '',
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            ",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a sync as completed successfully.
    pub async fn mark_success(&self, account_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE accounts
            SET sync_status = 'success', last_sync_error = '',
                last_synced_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            ",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a sync as failed with the error text.
    pub async fn mark_failed(&self, account_id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE accounts
            SET sync_status = 'failed', last_sync_error = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            ",
        )
        .bind(error)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
