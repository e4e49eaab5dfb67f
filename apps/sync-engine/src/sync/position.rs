//! Position reconstruction from raw deal streams.
//!
//! Groups deals by position id, orders them by execution time and derives
//! the trade-record fields: side, entry/exit attributes, lot size, realized
//! profit and the risk metrics (bullet size, reward:risk ratio).

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use super::instruments::Instrument;
use super::stop_loss::ResolvedStops;
use super::{deal_ticket, position_ticket};
use crate::venue::messages::{Deal, OpenPosition, SIDE_BUY, SIDE_SELL};

/// Direction of a reconciled position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    /// Bought to open.
    Long,
    /// Sold to open.
    Short,
}

impl TradeSide {
    /// Side string as persisted on the trades row.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Sign applied to price movement when computing reward:risk.
    #[must_use]
    pub const fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Position side from the venue side code of an *opening* deal or an
    /// open-position snapshot: the code is the position's own direction.
    #[must_use]
    pub const fn from_opening_code(code: i32) -> Self {
        if code == SIDE_SELL { Self::Short } else { Self::Long }
    }

    /// Position side from the venue side code of a *closing* deal: a sell
    /// closes a long, a buy closes a short, so the code is inverted.
    #[must_use]
    pub const fn from_closing_code(code: i32) -> Self {
        if code == SIDE_BUY { Self::Short } else { Self::Long }
    }
}

/// Price-to-points multiplier by instrument.
///
/// This is a symbol-name classifier, not a true instrument metadata lookup:
/// JPY-quoted pairs price in 2 decimals, metals and index CFDs quote whole
/// points, major forex pairs price in 4 decimals.
#[must_use]
pub fn points_multiplier(symbol: &str) -> f64 {
    if symbol.contains("JPY") {
        return 100.0;
    }
    if symbol.contains("XAU") || symbol.contains("GOLD") || symbol.contains("XPT") {
        return 1.0;
    }
    if symbol.contains("NAS")
        || symbol.contains("US30")
        || symbol.contains("SPD")
        || symbol.contains("HSI")
    {
        return 1.0;
    }
    if symbol.len() >= 6
        && (symbol.contains("USD") || symbol.contains("EUR") || symbol.contains("GBP"))
    {
        return 10_000.0;
    }
    1.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Bullet size: point distance between entry and the initial stop, used as
/// the risk-sizing denominator. Only defined when the initial stop is known
/// and positive.
#[must_use]
pub fn bullet_size(entry_price: f64, initial_stop: Option<f64>, multiplier: f64) -> Option<f64> {
    let stop = initial_stop.filter(|s| *s > 0.0)?;
    if entry_price <= 0.0 {
        return None;
    }
    Some(round2((entry_price - stop).abs() * multiplier))
}

/// Reward:risk ratio: signed realized price movement in points divided by
/// bullet size. `None` when no bullet size is defined, zero when the bullet
/// size rounds to zero.
#[must_use]
pub fn reward_risk(
    entry_price: f64,
    exit_price: f64,
    multiplier: f64,
    side: TradeSide,
    bullet: Option<f64>,
) -> Option<f64> {
    let bullet = bullet?;
    if bullet <= 0.0 {
        return Some(0.0);
    }
    let pnl_points = round2((exit_price - entry_price) * multiplier * side.sign());
    Some(round2(pnl_points / bullet))
}

/// Realized profit in account currency units from integer minor units.
#[must_use]
pub fn realized_profit(gross_profit: i64, commission: i64, swap: i64) -> f64 {
    (gross_profit + commission + swap) as f64 / 100.0
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// One reconciled trade row, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    /// Synthetic idempotency key, unique per account.
    pub ticket: String,
    /// Instrument display name.
    pub symbol: String,
    /// Position direction.
    pub side: TradeSide,
    /// Entry price.
    pub entry_price: f64,
    /// Exit price; `None` while the position is open.
    pub exit_price: Option<f64>,
    /// Volume in lots.
    pub lot_size: f64,
    /// Realized profit; `None` while open.
    pub pnl: Option<f64>,
    /// Entry time.
    pub entry_time: DateTime<Utc>,
    /// Exit time; set iff `exit_price` is set.
    pub exit_time: Option<DateTime<Utc>>,
    /// Authoritative initial stop-loss, when resolved.
    pub initial_sl: Option<f64>,
    /// Stop in effect at exit.
    pub exit_sl: Option<f64>,
    /// Risk-sizing denominator; only set with a positive initial stop.
    pub bullet_size: Option<f64>,
    /// Reward:risk ratio.
    pub rr_ratio: Option<f64>,
    /// Stop history JSON array.
    pub sl_history: String,
    /// Provenance note.
    pub notes: String,
}

/// Deals of one position, ordered by execution time.
#[derive(Debug, Clone)]
pub struct PositionGroup {
    /// Venue position id.
    pub position_id: i64,
    /// Deals sorted ascending by execution timestamp.
    pub deals: Vec<Deal>,
}

impl PositionGroup {
    /// Entry time: the first deal's execution timestamp.
    #[must_use]
    pub fn entry_time(&self) -> i64 {
        self.deals.first().map_or(0, |d| d.execution_timestamp)
    }

    /// The order id that created this position.
    #[must_use]
    pub fn opening_order_id(&self) -> Option<i64> {
        self.deals.first().map(|d| d.order_id).filter(|id| *id > 0)
    }

    /// Timestamp of the last deal seen for this position.
    #[must_use]
    pub fn last_deal_time(&self) -> i64 {
        self.deals.last().map_or(0, |d| d.execution_timestamp)
    }

    /// Symbol id of the position's instrument.
    #[must_use]
    pub fn symbol_id(&self) -> i64 {
        self.deals.first().map_or(0, |d| d.symbol_id)
    }

    /// Deals whose close-detail carries a positive opening price.
    pub fn closing_deals(&self) -> impl Iterator<Item = &Deal> {
        self.deals.iter().filter(|d| d.is_closing())
    }
}

/// Group a flat deal stream by position id, ordering each group by
/// execution time ascending.
#[must_use]
pub fn group_deals(deals: Vec<Deal>) -> Vec<PositionGroup> {
    let mut groups: HashMap<i64, Vec<Deal>> = HashMap::new();
    for deal in deals {
        groups.entry(deal.position_id).or_default().push(deal);
    }

    let mut result: Vec<PositionGroup> = groups
        .into_iter()
        .map(|(position_id, mut deals)| {
            deals.sort_by_key(|d| d.execution_timestamp);
            PositionGroup { position_id, deals }
        })
        .collect();
    // Deterministic processing order across runs.
    result.sort_by_key(|g| g.position_id);
    result
}

/// Build the trade record for one closing deal of a position.
///
/// Returns `None` for deals without close-detail (opening/adding deals are
/// only used for entry attributes).
#[must_use]
pub fn closed_trade_record(
    deal: &Deal,
    entry_time: i64,
    instrument: &Instrument,
    stops: &ResolvedStops,
    notes: &str,
) -> Option<TradeRecord> {
    let detail = deal.close_position_detail.filter(|d| d.entry_price > 0.0)?;

    let side = TradeSide::from_closing_code(deal.trade_side);
    let lot_size = deal.volume as f64 / instrument.contract_size as f64;
    let pnl = realized_profit(detail.gross_profit, detail.commission, detail.swap);
    let multiplier = points_multiplier(&instrument.name);
    let bullet = bullet_size(detail.entry_price, stops.initial, multiplier);
    let rr = reward_risk(
        detail.entry_price,
        deal.execution_price,
        multiplier,
        side,
        bullet,
    );

    Some(TradeRecord {
        ticket: deal_ticket(deal.deal_id),
        symbol: instrument.name.clone(),
        side,
        entry_price: detail.entry_price,
        exit_price: Some(deal.execution_price),
        lot_size,
        pnl: Some(pnl),
        entry_time: millis_to_datetime(entry_time),
        exit_time: Some(millis_to_datetime(deal.execution_timestamp)),
        initial_sl: stops.initial,
        exit_sl: stops.exit_stop(detail.stop_loss, deal.order_id),
        bullet_size: bullet,
        rr_ratio: rr,
        sl_history: stops.history_json(),
        notes: notes.to_string(),
    })
}

/// Build the trade record for a still-open position snapshot.
#[must_use]
pub fn open_trade_record(
    position: &OpenPosition,
    instrument: &Instrument,
    stops: &ResolvedStops,
    notes: &str,
) -> TradeRecord {
    let side = TradeSide::from_opening_code(position.trade_data.trade_side);
    let entry_price = position.entry_price();
    let lot_size = position.trade_data.volume as f64 / instrument.contract_size as f64;
    let multiplier = points_multiplier(&instrument.name);
    let bullet = bullet_size(entry_price, stops.initial, multiplier);

    TradeRecord {
        ticket: position_ticket(position.position_id),
        symbol: instrument.name.clone(),
        side,
        entry_price,
        exit_price: None,
        lot_size,
        pnl: None,
        entry_time: millis_to_datetime(position.trade_data.entry_timestamp),
        exit_time: None,
        initial_sl: stops.initial,
        exit_sl: if position.stop_loss > 0.0 {
            Some(position.stop_loss)
        } else {
            None
        },
        bullet_size: bullet,
        rr_ratio: None,
        sl_history: stops.history_json(),
        notes: notes.to_string(),
    }
}
