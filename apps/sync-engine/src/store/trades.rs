//! Trades table access.
//!
//! Trade rows are keyed for idempotency by (account id, ticket). Writes are
//! insert-only: a full manual resync deletes and recreates the account's
//! rows, the live listener only inserts tickets it has not seen. Dedup uses
//! existence checks scoped by account id and ticket, tolerating benign races
//! across concurrent writers.

use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::StoreError;
use crate::sync::position::TradeRecord;
use crate::sync::{legacy_position_ticket, position_ticket};

/// Trades table operations.
#[derive(Debug, Clone)]
pub struct TradeStore {
    pool: SqlitePool,
}

impl TradeStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begin a batch transaction.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Clean-slate delete of all trade rows for an account.
    pub async fn delete_for_account(&self, account_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM trades WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Whether a ticket already exists for this account.
    pub async fn exists(&self, account_id: i64, ticket: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::exists_in(&mut conn, account_id, ticket).await
    }

    async fn exists_in(
        conn: &mut SqliteConnection,
        account_id: i64,
        ticket: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM trades WHERE account_id = ? AND ticket = ?)",
        )
        .bind(account_id)
        .bind(ticket)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count != 0)
    }

    /// Whether an open-position row exists under the canonical or legacy
    /// ticket scheme.
    pub async fn open_position_exists(
        &self,
        account_id: i64,
        position_id: i64,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM trades WHERE account_id = ? AND (ticket = ? OR ticket = ?))",
        )
        .bind(account_id)
        .bind(position_ticket(position_id))
        .bind(legacy_position_ticket(position_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count != 0)
    }

    /// Initial stop recorded on an open-position row, if any.
    pub async fn open_position_initial_stop(
        &self,
        account_id: i64,
        position_id: i64,
    ) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query(
            "SELECT initial_sl FROM trades WHERE account_id = ? AND (ticket = ? OR ticket = ?)",
        )
        .bind(account_id)
        .bind(position_ticket(position_id))
        .bind(legacy_position_ticket(position_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.try_get::<Option<f64>, _>("initial_sl").ok().flatten()))
    }

    /// Remove the open-position row for a position that just closed.
    pub async fn delete_open_position(
        &self,
        account_id: i64,
        position_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM trades WHERE account_id = ? AND (ticket = ? OR ticket = ?)")
            .bind(account_id)
            .bind(position_ticket(position_id))
            .bind(legacy_position_ticket(position_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a trade record unless its ticket already exists.
    ///
    /// Returns whether a row was inserted.
    pub async fn insert_if_absent(
        &self,
        account_id: i64,
        record: &TradeRecord,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_if_absent_in(&mut conn, account_id, record).await
    }

    /// Insert-if-absent on an explicit connection, for use inside batch
    /// transactions. Each insert is independent: a failure propagates
    /// cleanly instead of corrupting the batch's reported progress.
    pub async fn insert_if_absent_in(
        conn: &mut SqliteConnection,
        account_id: i64,
        record: &TradeRecord,
    ) -> Result<bool, StoreError> {
        if Self::exists_in(conn, account_id, &record.ticket).await? {
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO trades (
                account_id, symbol, side, entry_price, exit_price, lot_size,
                pnl, entry_time, exit_time, trade_type, notes, ticket,
                initial_sl, exit_sl, bullet_size, rr_ratio, sl_history
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'actual', ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(account_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.entry_price)
        .bind(record.exit_price)
        .bind(record.lot_size)
        .bind(record.pnl)
        .bind(record.entry_time)
        .bind(record.exit_time)
        .bind(&record.notes)
        .bind(&record.ticket)
        .bind(record.initial_sl)
        .bind(record.exit_sl)
        .bind(record.bullet_size)
        .bind(record.rr_ratio)
        .bind(&record.sl_history)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }

    /// Insert a hosted-terminal import unless a matching row exists.
    ///
    /// Imported rows carry no venue ticket, so dedup is heuristic: account,
    /// symbol, entry time and lot size together identify the position.
    pub async fn insert_imported_if_absent(
        &self,
        account_id: i64,
        trade: &crate::sync::metaapi::ImportedTrade,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r"
            SELECT EXISTS(
                SELECT 1 FROM trades
                WHERE account_id = ? AND symbol = ? AND entry_time = ? AND lot_size = ?
            )
            ",
        )
        .bind(account_id)
        .bind(&trade.symbol)
        .bind(trade.entry_time)
        .bind(trade.lot_size)
        .fetch_one(&self.pool)
        .await?;
        if count != 0 {
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO trades (
                account_id, symbol, side, entry_price, exit_price, lot_size,
                pnl, entry_time, exit_time, trade_type, notes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'actual', ?)
            ",
        )
        .bind(account_id)
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.lot_size)
        .bind(trade.pnl)
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(&trade.notes)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Number of trade rows for an account.
    pub async fn count_for_account(&self, account_id: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::make_pool;
    use crate::sync::position::TradeSide;
    use chrono::Utc;

    fn make_record(ticket: &str) -> TradeRecord {
        TradeRecord {
            ticket: ticket.to_string(),
            symbol: "XAUUSD".to_string(),
            side: TradeSide::Long,
            entry_price: 2000.0,
            exit_price: Some(2010.0),
            lot_size: 0.5,
            pnl: Some(10.0),
            entry_time: Utc::now(),
            exit_time: Some(Utc::now()),
            initial_sl: Some(1990.0),
            exit_sl: None,
            bullet_size: Some(10.0),
            rr_ratio: Some(1.0),
            sl_history: "[]".to_string(),
            notes: "sync".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_ticket() {
        let pool = make_pool().await;
        let store = TradeStore::new(pool);

        let record = make_record("ctrader-deal-1");
        assert!(store.insert_if_absent(1, &record).await.unwrap());
        assert!(!store.insert_if_absent(1, &record).await.unwrap());
        assert_eq!(store.count_for_account(1).await.unwrap(), 1);

        // Same ticket on another account is a distinct row.
        assert!(store.insert_if_absent(2, &record).await.unwrap());
    }

    #[tokio::test]
    async fn clean_slate_delete() {
        let pool = make_pool().await;
        let store = TradeStore::new(pool);

        store
            .insert_if_absent(1, &make_record("ctrader-deal-1"))
            .await
            .unwrap();
        store
            .insert_if_absent(1, &make_record("ctrader-deal-2"))
            .await
            .unwrap();
        store
            .insert_if_absent(2, &make_record("ctrader-deal-3"))
            .await
            .unwrap();

        assert_eq!(store.delete_for_account(1).await.unwrap(), 2);
        assert_eq!(store.count_for_account(1).await.unwrap(), 0);
        assert_eq!(store.count_for_account(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_position_lookup_tolerates_legacy_tickets() {
        let pool = make_pool().await;
        let store = TradeStore::new(pool);

        let mut record = make_record("ctrader-77");
        record.exit_price = None;
        record.exit_time = None;
        record.initial_sl = Some(1985.0);
        store.insert_if_absent(1, &record).await.unwrap();

        assert!(store.open_position_exists(1, 77).await.unwrap());
        assert_eq!(
            store.open_position_initial_stop(1, 77).await.unwrap(),
            Some(1985.0)
        );

        store.delete_open_position(1, 77).await.unwrap();
        assert!(!store.open_position_exists(1, 77).await.unwrap());
    }

    #[tokio::test]
    async fn imported_rows_dedup_heuristically() {
        let pool = make_pool().await;
        let store = TradeStore::new(pool);

        let trade = crate::sync::metaapi::ImportedTrade {
            symbol: "EURUSD".to_string(),
            side: "long".to_string(),
            entry_price: 1.1,
            exit_price: 1.2,
            lot_size: 0.5,
            pnl: 50.0,
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            notes: "MT5 Sync: Position p1".to_string(),
        };

        assert!(store.insert_imported_if_absent(1, &trade).await.unwrap());
        assert!(!store.insert_imported_if_absent(1, &trade).await.unwrap());
        assert_eq!(store.count_for_account(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_transaction_commits_atomically() {
        let pool = make_pool().await;
        let store = TradeStore::new(pool);

        let mut tx = store.begin().await.unwrap();
        for i in 0..5 {
            let record = make_record(&format!("ctrader-deal-{i}"));
            TradeStore::insert_if_absent_in(&mut tx, 1, &record)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        assert_eq!(store.count_for_account(1).await.unwrap(), 5);
    }
}
