//! Live execution listener.
//!
//! One long-lived task per broker-linked account: connects, authenticates,
//! takes an insert-if-absent snapshot of already-open positions, then reacts
//! to push execution events, synthesizing trade inserts incrementally. The
//! listener never deletes history; a closed position only replaces its own
//! open row. Connection failures are retried after a jittered backoff until
//! the cancellation token fires.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::instruments::{Instrument, InstrumentCache};
use super::orchestrator::SyncError;
use super::position::{closed_trade_record, open_trade_record};
use super::stop_loss::ResolvedStops;
use crate::config::SyncSettings;
use crate::store::{BrokerAccount, TradeStore};
use crate::venue::messages::{
    self, AccountAuthRequest, AppAuthRequest, Deal, ExecutionEvent, OpenPosition,
    PositionTradeData, Reconcile, ReconcileRequest,
};
use crate::venue::VenueSession;

/// Run the listener loop for one account until cancelled.
pub async fn run_listener(
    trades: TradeStore,
    settings: SyncSettings,
    account: BrokerAccount,
    cancel: CancellationToken,
) {
    tracing::info!(account_id = account.id, "live listener started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_and_listen(&trades, &settings, &account, &cancel).await {
            Ok(()) => break,
            Err(e) => {
                let delay = jittered(settings.listener_retry_delay);
                tracing::warn!(
                    account_id = account.id,
                    error = %e,
                    retry_ms = delay.as_millis(),
                    "listener connection lost, retrying"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }

    tracing::info!(account_id = account.id, "live listener stopped");
}

/// Backoff delay with ±20% jitter so reconnecting accounts do not stampede.
fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..=1.2);
    base.mul_f64(factor)
}

async fn connect_and_listen(
    trades: &TradeStore,
    settings: &SyncSettings,
    account: &BrokerAccount,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let mut session =
        VenueSession::connect(account.environment.endpoint(), settings.request_timeout).await?;

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

    // Instrument metadata must be gathered before the socket switches to
    // push mode; ids first seen in later events degrade to defaults.
    let mut cache = InstrumentCache::new();
    cache
        .prefetch_names(&mut session, account.venue_account_id)
        .await;

    initial_snapshot(trades, account, &mut session, &mut cache).await?;

    // Push-event phase: reads and keepalive writes interleave.
    let (mut writer, mut reader) = session.into_split();
    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.reset();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(account_id = account.id, "listener cancelled");
                return Ok(());
            }
            _ = heartbeat.tick() => {
                writer.send_heartbeat().await?;
            }
            frame = reader.next_frame() => {
                let frame = frame?;
                if frame.payload_type != messages::EXECUTION_EVENT {
                    continue;
                }
                match frame.decode::<ExecutionEvent>() {
                    Ok(event) => {
                        handle_execution_event(trades, account.id, &cache, &event).await;
                    }
                    Err(e) => {
                        tracing::warn!(account_id = account.id, error = %e, "undecodable execution event");
                    }
                }
            }
        }
    }
}

/// Insert already-open positions that have no row yet. Never deletes.
async fn initial_snapshot(
    trades: &TradeStore,
    account: &BrokerAccount,
    session: &mut VenueSession,
    cache: &mut InstrumentCache,
) -> Result<(), SyncError> {
    let frame = session
        .send(
            messages::RECONCILE_REQ,
            &ReconcileRequest {
                ctid_trader_account_id: account.venue_account_id,
            },
        )
        .await?;

    let Ok(reconcile) = frame.decode::<Reconcile>() else {
        tracing::warn!(account_id = account.id, "undecodable reconcile snapshot");
        return Ok(());
    };

    let mut inserted = 0usize;
    for position in &reconcile.position {
        cache
            .ensure(
                session,
                account.venue_account_id,
                &[position.trade_data.symbol_id],
            )
            .await;

        match trades
            .open_position_exists(account.id, position.position_id)
            .await
        {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "snapshot dedup check failed");
                continue;
            }
        }

        let instrument = instrument_for(cache, position.trade_data.symbol_id, position.symbol_name.as_deref());
        let record = open_trade_record(
            position,
            &instrument,
            &ResolvedStops::default(),
            "cTrader Push: Initial Sync",
        );
        match trades.insert_if_absent(account.id, &record).await {
            Ok(true) => inserted += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    account_id = account.id,
                    ticket = %record.ticket,
                    error = %e,
                    "snapshot insert failed"
                );
            }
        }
    }

    if inserted > 0 {
        tracing::info!(account_id = account.id, inserted, "initial snapshot inserted open positions");
    }
    Ok(())
}

/// Instrument from the cache, falling back to the name the venue attached
/// to the position itself.
fn instrument_for(
    cache: &InstrumentCache,
    symbol_id: i64,
    position_symbol_name: Option<&str>,
) -> Instrument {
    let mut instrument = cache.get(symbol_id);
    if instrument.name == super::instruments::UNKNOWN_SYMBOL {
        if let Some(name) = position_symbol_name.filter(|n| !n.is_empty()) {
            instrument.name = name.to_string();
        }
    }
    instrument
}

/// Apply one push execution event. Persistence failures are logged and the
/// event loop continues with best-effort semantics.
async fn handle_execution_event(
    trades: &TradeStore,
    account_id: i64,
    cache: &InstrumentCache,
    event: &ExecutionEvent,
) {
    if !event.is_fill() {
        return;
    }
    let Some(deal) = &event.deal else { return };
    if deal.deal_id == 0 {
        return;
    }

    let instrument = cache.get(deal.symbol_id);
    let position_stop = event
        .position
        .as_ref()
        .map(|p| p.stop_loss)
        .filter(|sl| *sl > 0.0);

    if deal.is_closing() {
        close_position(trades, account_id, deal, &instrument, position_stop).await;
    } else {
        open_position(trades, account_id, deal, &instrument, position_stop).await;
    }
}

async fn close_position(
    trades: &TradeStore,
    account_id: i64,
    deal: &Deal,
    instrument: &Instrument,
    position_stop: Option<f64>,
) {
    // The open row recorded the stop in effect at entry; carry it over to
    // the closed row before replacing.
    let initial = match trades
        .open_position_initial_stop(account_id, deal.position_id)
        .await
    {
        Ok(initial) => initial.filter(|sl| *sl > 0.0),
        Err(e) => {
            tracing::warn!(account_id, error = %e, "initial stop lookup failed");
            None
        }
    };

    if let Err(e) = trades
        .delete_open_position(account_id, deal.position_id)
        .await
    {
        tracing::warn!(account_id, error = %e, "open row replacement failed");
    }

    let stops = ResolvedStops {
        initial,
        ..Default::default()
    };
    let Some(mut record) = closed_trade_record(
        deal,
        deal.execution_timestamp,
        instrument,
        &stops,
        "cTrader Push: Closed Position",
    ) else {
        return;
    };
    if position_stop.is_some() {
        record.exit_sl = position_stop;
    }

    match trades.insert_if_absent(account_id, &record).await {
        Ok(true) => {
            tracing::info!(account_id, ticket = %record.ticket, "closed position recorded");
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(account_id, ticket = %record.ticket, error = %e, "closed insert failed");
        }
    }
}

async fn open_position(
    trades: &TradeStore,
    account_id: i64,
    deal: &Deal,
    instrument: &Instrument,
    position_stop: Option<f64>,
) {
    match trades.open_position_exists(account_id, deal.position_id).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(account_id, error = %e, "open dedup check failed");
            return;
        }
    }

    // A push fill carries the position's entry attributes on the deal; the
    // current stop doubles as the initial stop since the fill is observed
    // live.
    let position = OpenPosition {
        position_id: deal.position_id,
        price: deal.execution_price,
        stop_loss: position_stop.unwrap_or(0.0),
        symbol_name: None,
        trade_data: PositionTradeData {
            symbol_id: deal.symbol_id,
            volume: deal.volume,
            trade_side: deal.trade_side,
            entry_price: deal.execution_price,
            entry_timestamp: deal.execution_timestamp,
        },
    };
    let stops = ResolvedStops {
        initial: position_stop,
        ..Default::default()
    };
    let record = open_trade_record(&position, instrument, &stops, "cTrader Push: Open Position");

    match trades.insert_if_absent(account_id, &record).await {
        Ok(true) => {
            tracing::info!(account_id, ticket = %record.ticket, "open position recorded");
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(account_id, ticket = %record.ticket, error = %e, "open insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::make_pool;
    use crate::venue::messages::ClosePositionDetail;

    fn make_fill_event(deal: Deal, position_stop: f64) -> ExecutionEvent {
        ExecutionEvent {
            execution_type: 2,
            deal: Some(deal),
            position: Some(OpenPosition {
                position_id: 0,
                price: 0.0,
                stop_loss: position_stop,
                symbol_name: None,
                trade_data: PositionTradeData::default(),
            }),
        }
    }

    fn opening_deal() -> Deal {
        Deal {
            deal_id: 100,
            order_id: 1000,
            position_id: 55,
            symbol_id: 1,
            volume: 100_000,
            execution_price: 2000.0,
            execution_timestamp: 1_700_000_000_000,
            trade_side: messages::SIDE_BUY,
            close_position_detail: None,
        }
    }

    fn closing_deal() -> Deal {
        Deal {
            deal_id: 101,
            order_id: 1001,
            position_id: 55,
            symbol_id: 1,
            volume: 100_000,
            execution_price: 2010.0,
            execution_timestamp: 1_700_000_100_000,
            trade_side: messages::SIDE_SELL,
            close_position_detail: Some(ClosePositionDetail {
                entry_price: 2000.0,
                gross_profit: 1_000,
                commission: 0,
                swap: 0,
                stop_loss: 0.0,
            }),
        }
    }

    #[tokio::test]
    async fn open_then_close_replaces_the_open_row() {
        let pool = make_pool().await;
        let trades = TradeStore::new(pool);
        let cache = InstrumentCache::new();

        handle_execution_event(&trades, 1, &cache, &make_fill_event(opening_deal(), 1990.0)).await;
        assert!(trades.open_position_exists(1, 55).await.unwrap());
        assert_eq!(
            trades.open_position_initial_stop(1, 55).await.unwrap(),
            Some(1990.0)
        );

        handle_execution_event(&trades, 1, &cache, &make_fill_event(closing_deal(), 1995.0)).await;
        assert!(!trades.open_position_exists(1, 55).await.unwrap());
        assert!(trades.exists(1, "ctrader-deal-101").await.unwrap());
        assert_eq!(trades.count_for_account(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_fill_events_insert_once() {
        let pool = make_pool().await;
        let trades = TradeStore::new(pool);
        let cache = InstrumentCache::new();

        let event = make_fill_event(opening_deal(), 0.0);
        handle_execution_event(&trades, 1, &cache, &event).await;
        handle_execution_event(&trades, 1, &cache, &event).await;

        assert_eq!(trades.count_for_account(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_fill_events_are_ignored() {
        let pool = make_pool().await;
        let trades = TradeStore::new(pool);
        let cache = InstrumentCache::new();

        let mut event = make_fill_event(opening_deal(), 0.0);
        event.execution_type = 5;
        handle_execution_event(&trades, 1, &cache, &event).await;

        assert_eq!(trades.count_for_account(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn events_without_a_deal_are_ignored() {
        let pool = make_pool().await;
        let trades = TradeStore::new(pool);
        let cache = InstrumentCache::new();

        let mut event = make_fill_event(opening_deal(), 0.0);
        event.deal = None;
        handle_execution_event(&trades, 1, &cache, &event).await;
        assert_eq!(trades.count_for_account(1).await.unwrap(), 0);
    }
}
