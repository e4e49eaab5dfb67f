//! Manual full-resync orchestration.
//!
//! Drives the clean-slate history sync for one account:
//! preparing → fetching history (i/N) → scanning stop losses (i/N) →
//! syncing open positions (i/N) → success | failed. Progress is written to
//! the account's status field before each phase; trade rows are committed in
//! fixed-size transaction batches to bound transaction size and keep status
//! visible between batches.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;

use super::instruments::InstrumentCache;
use super::position::{closed_trade_record, group_deals, open_trade_record};
use super::stop_loss::{OrderEvidenceSource, StopLossResolver};
use crate::config::SyncSettings;
use crate::store::{AccountStore, BrokerAccount, StoreError, TradeStore};
use crate::venue::messages::{
    self, AccountAuthRequest, AppAuthRequest, DealList, DealListRequest, HistoricalOrder,
    OrderDetails, OrderDetailsRequest, OrderList, OrderListRequest, OrdersByPositionRequest,
    Reconcile, ReconcileRequest,
};
use crate::venue::{TransportError, VenueSession};

/// Errors that fail a sync run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transport-level failure (dial, auth, timeout, venue error).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counters reported after a successful run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    /// Position groups reconstructed from history.
    pub positions: usize,
    /// Closed trade rows inserted.
    pub closed_trades: usize,
    /// Open trade rows inserted.
    pub open_trades: usize,
}

/// Order evidence lookups backed by the live session, with request pacing
/// to stay under the venue's rate limits.
struct VenueEvidenceSource<'a> {
    session: &'a mut VenueSession,
    venue_account_id: i64,
    pacing: std::time::Duration,
}

#[async_trait]
impl OrderEvidenceSource for VenueEvidenceSource<'_> {
    async fn order_details(
        &mut self,
        order_id: i64,
    ) -> Result<Option<HistoricalOrder>, TransportError> {
        tokio::time::sleep(self.pacing).await;
        let frame = self
            .session
            .send(
                messages::ORDER_DETAILS_REQ,
                &OrderDetailsRequest {
                    ctid_trader_account_id: self.venue_account_id,
                    order_id,
                },
            )
            .await?;

        // Malformed payloads degrade to "no data from this call".
        match frame.decode::<OrderDetails>() {
            Ok(details) if details.order.order_id > 0 => Ok(Some(details.order)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(order_id, error = %e, "undecodable order details reply");
                Ok(None)
            }
        }
    }

    async fn orders_for_position(
        &mut self,
        position_id: i64,
        from_timestamp: i64,
        to_timestamp: i64,
    ) -> Result<Vec<HistoricalOrder>, TransportError> {
        tokio::time::sleep(self.pacing).await;
        let frame = self
            .session
            .send(
                messages::ORDERS_BY_POSITION_REQ,
                &OrdersByPositionRequest {
                    ctid_trader_account_id: self.venue_account_id,
                    position_id,
                    from_timestamp,
                    to_timestamp,
                },
            )
            .await?;

        match frame.decode::<OrderList>() {
            Ok(list) => Ok(list.order),
            Err(e) => {
                tracing::warn!(position_id, error = %e, "undecodable order list reply");
                Ok(Vec::new())
            }
        }
    }
}

/// Historical page window `index` (0 = most recent), in epoch millis.
#[must_use]
pub fn page_window(now_ms: i64, page_days: i64, index: u32) -> (i64, i64) {
    let page_ms = page_days * 86_400_000;
    let to = now_ms - page_ms * i64::from(index);
    let from = now_ms - page_ms * i64::from(index + 1);
    (from, to)
}

async fn update_status(accounts: &AccountStore, account_id: i64, status: &str) {
    if let Err(e) = accounts.set_status(account_id, status).await {
        tracing::warn!(account_id, error = %e, "status update failed");
    }
}

/// Run a full manual resync for one account, recording the terminal status
/// on the accounts row. Never panics and never leaks an error to the caller;
/// the status field is the only failure surface.
///
/// The caller (the sync manager) must have stopped any live listener for
/// this account before invoking this.
pub async fn run_manual_sync(
    accounts: &AccountStore,
    trades: &TradeStore,
    settings: &SyncSettings,
    account: &BrokerAccount,
) {
    tracing::info!(account_id = account.id, "manual sync started");

    if let Err(e) = accounts.mark_preparing(account.id).await {
        tracing::warn!(account_id = account.id, error = %e, "failed to mark sync as preparing");
    }

    // Clean slate: a full resync deletes and recreates the account's rows.
    if let Err(e) = trades.delete_for_account(account.id).await {
        tracing::error!(account_id = account.id, error = %e, "clean-slate delete failed");
        let _ = accounts.mark_failed(account.id, &e.to_string()).await;
        return;
    }

    match sync_history(accounts, trades, settings, account).await {
        Ok(stats) => {
            tracing::info!(
                account_id = account.id,
                positions = stats.positions,
                closed_trades = stats.closed_trades,
                open_trades = stats.open_trades,
                "manual sync succeeded"
            );
            let _ = accounts.mark_success(account.id).await;
        }
        Err(e) => {
            tracing::error!(account_id = account.id, error = %e, "manual sync failed");
            let _ = accounts.mark_failed(account.id, &e.to_string()).await;
        }
    }
}

async fn sync_history(
    accounts: &AccountStore,
    trades: &TradeStore,
    settings: &SyncSettings,
    account: &BrokerAccount,
) -> Result<SyncStats, SyncError> {
    let mut session =
        VenueSession::connect(account.environment.endpoint(), settings.request_timeout).await?;

    // Two-step auth handshake; both must succeed before any data call.
    tokio::time::sleep(settings.auth_pacing).await;
    session
        .send_expect(
            messages::APP_AUTH_REQ,
            &AppAuthRequest {
                client_id: account.client_id.clone(),
                client_secret: account.client_secret.clone(),
            },
            messages::APP_AUTH_RES,
        )
        .await?;

    tokio::time::sleep(settings.auth_pacing).await;
    session
        .send_expect(
            messages::ACCOUNT_AUTH_REQ,
            &AccountAuthRequest {
                ctid_trader_account_id: account.venue_account_id,
                access_token: account.access_token.clone(),
            },
            messages::ACCOUNT_AUTH_RES,
        )
        .await?;

    let mut cache = InstrumentCache::new();
    tokio::time::sleep(settings.page_pacing).await;
    cache
        .prefetch_names(&mut session, account.venue_account_id)
        .await;

    // Page through the historical window collecting deals and orders. Order
    // history is an incidental by-product of the same pages, keyed by
    // position id for the stop-loss scan.
    let now_ms = Utc::now().timestamp_millis();
    let mut all_deals = Vec::new();
    let mut symbol_ids = Vec::new();
    let mut order_history: HashMap<i64, Vec<HistoricalOrder>> = HashMap::new();

    for page in 0..settings.page_count {
        update_status(
            accounts,
            account.id,
            &format!("syncing: fetching history ({}/{})...", page + 1, settings.page_count),
        )
        .await;
        let (from, to) = page_window(now_ms, settings.page_days, page);

        tokio::time::sleep(settings.page_pacing).await;
        let frame = session
            .send(
                messages::DEAL_LIST_REQ,
                &DealListRequest {
                    ctid_trader_account_id: account.venue_account_id,
                    from_timestamp: from,
                    to_timestamp: to,
                },
            )
            .await?;
        if let Ok(list) = frame.decode::<DealList>() {
            for deal in &list.deal {
                symbol_ids.push(deal.symbol_id);
            }
            all_deals.extend(list.deal);
        }

        tokio::time::sleep(settings.page_pacing).await;
        let frame = session
            .send(
                messages::ORDER_LIST_REQ,
                &OrderListRequest {
                    ctid_trader_account_id: account.venue_account_id,
                    from_timestamp: from,
                    to_timestamp: to,
                },
            )
            .await?;
        if let Ok(list) = frame.decode::<OrderList>() {
            for order in list.order {
                order_history.entry(order.position_id).or_default().push(order);
            }
        }
    }

    cache
        .ensure(&mut session, account.venue_account_id, &symbol_ids)
        .await;

    // Derive trade records per position, committing in batches.
    let groups = group_deals(all_deals);
    let total = groups.len();
    let resolver = StopLossResolver::new(settings);
    let mut stats = SyncStats {
        positions: total,
        ..Default::default()
    };
    tracing::info!(account_id = account.id, positions = total, "processing history");

    let empty_history: Vec<HistoricalOrder> = Vec::new();
    let mut processed = 0usize;
    for batch in groups.chunks(settings.batch_size.max(1)) {
        let mut tx = trades.begin().await?;
        for group in batch {
            processed += 1;
            update_status(
                accounts,
                account.id,
                &format!("syncing: scanning stop losses ({processed}/{total})..."),
            )
            .await;

            let bulk = order_history
                .get(&group.position_id)
                .unwrap_or(&empty_history);
            let stops = {
                let mut source = VenueEvidenceSource {
                    session: &mut session,
                    venue_account_id: account.venue_account_id,
                    pacing: settings.lookup_pacing,
                };
                resolver
                    .resolve(
                        &mut source,
                        group.position_id,
                        group.entry_time(),
                        group.last_deal_time(),
                        group.opening_order_id(),
                        bulk,
                        settings.initial_stop_window_ms,
                    )
                    .await
            };

            let instrument = cache.get(group.symbol_id());
            for deal in group.closing_deals() {
                if let Some(record) =
                    closed_trade_record(deal, group.entry_time(), &instrument, &stops, "cTrader Sync")
                {
                    if TradeStore::insert_if_absent_in(&mut tx, account.id, &record).await? {
                        stats.closed_trades += 1;
                    }
                }
            }
        }
        tx.commit().await.map_err(StoreError::from)?;
    }

    // Currently-open positions, inserted with null exit fields. Snapshot
    // positions are fetched live, so the acceptance window is much tighter.
    tokio::time::sleep(settings.page_pacing).await;
    let frame = session
        .send(
            messages::RECONCILE_REQ,
            &ReconcileRequest {
                ctid_trader_account_id: account.venue_account_id,
            },
        )
        .await?;
    let open_positions = frame.decode::<Reconcile>().map(|r| r.position).unwrap_or_default();

    let total_open = open_positions.len();
    let mut processed_open = 0usize;
    for batch in open_positions.chunks(settings.batch_size.max(1)) {
        let mut tx = trades.begin().await?;
        for position in batch {
            processed_open += 1;
            update_status(
                accounts,
                account.id,
                &format!("syncing: open positions ({processed_open}/{total_open})..."),
            )
            .await;

            cache
                .ensure(
                    &mut session,
                    account.venue_account_id,
                    &[position.trade_data.symbol_id],
                )
                .await;

            let bulk = order_history
                .get(&position.position_id)
                .unwrap_or(&empty_history);
            let stops = {
                let mut source = VenueEvidenceSource {
                    session: &mut session,
                    venue_account_id: account.venue_account_id,
                    pacing: settings.lookup_pacing,
                };
                resolver
                    .resolve(
                        &mut source,
                        position.position_id,
                        position.trade_data.entry_timestamp,
                        now_ms,
                        None,
                        bulk,
                        settings.snapshot_stop_window_ms,
                    )
                    .await
            };

            let instrument = cache.get(position.trade_data.symbol_id);
            let record = open_trade_record(position, &instrument, &stops, "cTrader Open");
            if TradeStore::insert_if_absent_in(&mut tx, account.id, &record).await? {
                stats.open_trades += 1;
            }
        }
        tx.commit().await.map_err(StoreError::from)?;
    }

    Ok(stats)
}
