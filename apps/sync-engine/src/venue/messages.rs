//! Venue wire messages.
//!
//! Typed schema for the venue's JSON framing: every frame carries a numeric
//! payload type, an optional client message id used for request/response
//! correlation, and a JSON payload body. Payloads are decoded into the domain
//! types below once, at the transport boundary.

use serde::{Deserialize, Serialize};

/// Application auth request.
pub const APP_AUTH_REQ: u32 = 2100;
/// Application auth response.
pub const APP_AUTH_RES: u32 = 2101;
/// Account auth request.
pub const ACCOUNT_AUTH_REQ: u32 = 2102;
/// Account auth response.
pub const ACCOUNT_AUTH_RES: u32 = 2103;
/// Whole-account symbol listing request.
pub const SYMBOLS_LIST_REQ: u32 = 2114;
/// Whole-account symbol listing response.
pub const SYMBOLS_LIST_RES: u32 = 2115;
/// Instrument metadata batch lookup request.
pub const SYMBOL_BY_ID_REQ: u32 = 2116;
/// Instrument metadata batch lookup response.
pub const SYMBOL_BY_ID_RES: u32 = 2117;
/// Open-position snapshot request.
pub const RECONCILE_REQ: u32 = 2124;
/// Open-position snapshot response.
pub const RECONCILE_RES: u32 = 2125;
/// Push-type execution event.
pub const EXECUTION_EVENT: u32 = 2126;
/// Windowed deal history request.
pub const DEAL_LIST_REQ: u32 = 2133;
/// Windowed deal history response.
pub const DEAL_LIST_RES: u32 = 2134;
/// Explicit venue error payload.
pub const ERROR_RES: u32 = 2142;
/// Windowed order history request.
pub const ORDER_LIST_REQ: u32 = 2175;
/// Windowed order history response.
pub const ORDER_LIST_RES: u32 = 2176;
/// Single order detail request.
pub const ORDER_DETAILS_REQ: u32 = 2181;
/// Single order detail response.
pub const ORDER_DETAILS_RES: u32 = 2182;
/// Per-position order listing request.
pub const ORDERS_BY_POSITION_REQ: u32 = 2183;
/// Per-position order listing response.
pub const ORDERS_BY_POSITION_RES: u32 = 2184;
/// Keepalive frame, sent by both sides.
pub const HEARTBEAT_EVENT: u32 = 51;

/// Venue trade-side code for a buy.
pub const SIDE_BUY: i32 = 1;
/// Venue trade-side code for a sell.
pub const SIDE_SELL: i32 = 2;

/// Execution-event types that carry a deal (fill events).
///
/// Other execution types (order accepted, replaced, cancelled, ...) carry no
/// fill and are ignored by the live listener.
pub const FILL_EVENT_TYPES: [i32; 2] = [2, 8];

/// One framed venue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Client-generated correlation id. Some venue replies omit echoing it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    /// Numeric payload type.
    pub payload_type: u32,
    /// Raw payload body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    /// Build a request frame with a correlation id.
    pub fn request<T: Serialize>(
        client_msg_id: String,
        payload_type: u32,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            client_msg_id: Some(client_msg_id),
            payload_type,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build a heartbeat frame (no correlation id, empty payload).
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            client_msg_id: None,
            payload_type: HEARTBEAT_EVENT,
            payload: serde_json::json!({}),
        }
    }

    /// Decode the payload body into a typed message.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Application-level credential exchange (first auth step).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAuthRequest {
    /// Application client id.
    pub client_id: String,
    /// Application client secret.
    pub client_secret: String,
}

/// Account-level token exchange (second auth step).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAuthRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
    /// Account-level access token.
    pub access_token: String,
}

/// Whole-account symbol name listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolsListRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
}

/// Batch instrument metadata lookup by id.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolByIdRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
    /// Instrument ids to resolve.
    pub symbol_id: Vec<i64>,
}

/// Time-windowed historical deal listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealListRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
    /// Window start (epoch millis).
    pub from_timestamp: i64,
    /// Window end (epoch millis).
    pub to_timestamp: i64,
}

/// Time-windowed historical order listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
    /// Window start (epoch millis).
    pub from_timestamp: i64,
    /// Window end (epoch millis).
    pub to_timestamp: i64,
}

/// Single order detail lookup.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetailsRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
    /// Order to fetch.
    pub order_id: i64,
}

/// Per-position order listing over an explicit window.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersByPositionRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
    /// Position whose orders are listed.
    pub position_id: i64,
    /// Window start (epoch millis).
    pub from_timestamp: i64,
    /// Window end (epoch millis).
    pub to_timestamp: i64,
}

/// Snapshot of currently open positions.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    /// Venue-side trading account id.
    pub ctid_trader_account_id: i64,
}

// ---------------------------------------------------------------------------
// Responses and push events
// ---------------------------------------------------------------------------

/// Instrument metadata entry. Both the whole-list and by-id responses use the
/// same `symbol` array; the light listing omits `lotSize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolEntry {
    /// Instrument id.
    pub symbol_id: i64,
    /// Display name; may be absent.
    #[serde(default)]
    pub symbol_name: String,
    /// Contract size; absent in the light listing.
    #[serde(default)]
    pub lot_size: i64,
}

/// Payload of `SYMBOLS_LIST_RES` and `SYMBOL_BY_ID_RES`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolList {
    /// Instrument entries.
    #[serde(default)]
    pub symbol: Vec<SymbolEntry>,
}

/// Close-detail embedded in a closing deal. Monetary fields are integer
/// minor units (cents).
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionDetail {
    /// Opening price of the position being closed.
    #[serde(default)]
    pub entry_price: f64,
    /// Gross profit in minor units.
    #[serde(default)]
    pub gross_profit: i64,
    /// Commission in minor units (usually negative).
    #[serde(default)]
    pub commission: i64,
    /// Swap in minor units.
    #[serde(default)]
    pub swap: i64,
    /// Stop in effect when the closing deal executed.
    #[serde(default)]
    pub stop_loss: f64,
}

/// An immutable execution record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    /// Unique deal id.
    #[serde(default)]
    pub deal_id: i64,
    /// Order that produced this fill.
    #[serde(default)]
    pub order_id: i64,
    /// Position this fill belongs to.
    #[serde(default)]
    pub position_id: i64,
    /// Instrument id.
    #[serde(default)]
    pub symbol_id: i64,
    /// Raw volume in base units.
    #[serde(default)]
    pub volume: i64,
    /// Execution price.
    #[serde(default)]
    pub execution_price: f64,
    /// Execution time (epoch millis).
    #[serde(default)]
    pub execution_timestamp: i64,
    /// Venue trade-side code.
    #[serde(default)]
    pub trade_side: i32,
    /// Present on closing deals only.
    #[serde(default)]
    pub close_position_detail: Option<ClosePositionDetail>,
}

impl Deal {
    /// A deal closes (part of) a position iff its close-detail carries a
    /// positive opening price.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.close_position_detail
            .is_some_and(|d| d.entry_price > 0.0)
    }
}

/// Payload of `DEAL_LIST_RES`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealList {
    /// Deals in the requested window.
    #[serde(default)]
    pub deal: Vec<Deal>,
}

/// Creation-time data attached to an order.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTradeData {
    /// Order creation time (epoch millis); 0 when unreported.
    #[serde(default)]
    pub open_timestamp: i64,
}

/// An order lifecycle record, used only as stop-loss evidence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalOrder {
    /// Order id.
    #[serde(default)]
    pub order_id: i64,
    /// Position the order belongs to.
    #[serde(default)]
    pub position_id: i64,
    /// Stop-loss level.
    #[serde(default)]
    pub stop_loss: f64,
    /// Stop price (stop orders).
    #[serde(default)]
    pub stop_price: f64,
    /// Last update time (epoch millis).
    #[serde(rename = "utcLastUpdateTimestamp", default)]
    pub last_update_timestamp: i64,
    /// Creation-time data, when reported.
    #[serde(default)]
    pub trade_data: Option<OrderTradeData>,
}

impl HistoricalOrder {
    /// Effective stop value: `stopLoss` wins, `stopPrice` is the fallback.
    /// Returns `None` when neither is positive.
    #[must_use]
    pub fn stop_value(&self) -> Option<f64> {
        if self.stop_loss > 0.0 {
            Some(self.stop_loss)
        } else if self.stop_price > 0.0 {
            Some(self.stop_price)
        } else {
            None
        }
    }

    /// Creation timestamp, when the venue reported one.
    #[must_use]
    pub fn open_timestamp(&self) -> Option<i64> {
        self.trade_data
            .map(|t| t.open_timestamp)
            .filter(|ts| *ts > 0)
    }
}

/// Payload of `ORDER_LIST_RES` and `ORDERS_BY_POSITION_RES`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderList {
    /// Orders in the requested window.
    #[serde(default)]
    pub order: Vec<HistoricalOrder>,
}

/// Payload of `ORDER_DETAILS_RES`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    /// The requested order.
    #[serde(default)]
    pub order: HistoricalOrder,
}

/// Entry-time data attached to an open position.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionTradeData {
    /// Instrument id.
    #[serde(default)]
    pub symbol_id: i64,
    /// Raw volume in base units.
    #[serde(default)]
    pub volume: i64,
    /// Venue trade-side code (the position's own direction).
    #[serde(default)]
    pub trade_side: i32,
    /// Entry price as reported by push events.
    #[serde(default)]
    pub entry_price: f64,
    /// Entry time (epoch millis).
    #[serde(default)]
    pub entry_timestamp: i64,
}

/// A currently open position from the snapshot call or a push event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    /// Position id.
    #[serde(default)]
    pub position_id: i64,
    /// Entry price as reported at the top level of the snapshot.
    #[serde(default)]
    pub price: f64,
    /// Current stop-loss level.
    #[serde(default)]
    pub stop_loss: f64,
    /// Display name attached to the position, when present.
    #[serde(default)]
    pub symbol_name: Option<String>,
    /// Entry-time data.
    #[serde(default)]
    pub trade_data: PositionTradeData,
}

impl OpenPosition {
    /// Entry price: the snapshot reports it at the top level, push events
    /// inside the trade data.
    #[must_use]
    pub fn entry_price(&self) -> f64 {
        if self.price > 0.0 {
            self.price
        } else {
            self.trade_data.entry_price
        }
    }
}

/// Payload of `RECONCILE_RES`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconcile {
    /// Currently open positions.
    #[serde(default)]
    pub position: Vec<OpenPosition>,
}

/// Push-type execution event carrying a fill and the affected position.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    /// Venue execution type code.
    #[serde(default)]
    pub execution_type: i32,
    /// The fill, when the event carries one.
    #[serde(default)]
    pub deal: Option<Deal>,
    /// The affected position, when attached.
    #[serde(default)]
    pub position: Option<OpenPosition>,
}

impl ExecutionEvent {
    /// Whether this event type carries a fill the listener should process.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        FILL_EVENT_TYPES.contains(&self.execution_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_preserves_correlation_id() {
        let frame = Frame::request(
            "m-1".to_string(),
            DEAL_LIST_REQ,
            &DealListRequest {
                ctid_trader_account_id: 42,
                from_timestamp: 100,
                to_timestamp: 200,
            },
        )
        .unwrap();

        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.client_msg_id.as_deref(), Some("m-1"));
        assert_eq!(parsed.payload_type, DEAL_LIST_REQ);
        assert_eq!(parsed.payload["ctidTraderAccountId"], 42);
    }

    #[test]
    fn heartbeat_frame_has_no_correlation_id() {
        let frame = Frame::heartbeat();
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("clientMsgId"));
        assert_eq!(frame.payload_type, HEARTBEAT_EVENT);
    }

    #[test]
    fn deal_closing_classification() {
        let mut deal = Deal::default();
        assert!(!deal.is_closing());

        deal.close_position_detail = Some(ClosePositionDetail::default());
        assert!(!deal.is_closing());

        deal.close_position_detail = Some(ClosePositionDetail {
            entry_price: 1.2345,
            ..Default::default()
        });
        assert!(deal.is_closing());
    }

    #[test]
    fn order_stop_value_prefers_stop_loss() {
        let order = HistoricalOrder {
            stop_loss: 1.10,
            stop_price: 1.20,
            ..Default::default()
        };
        assert_eq!(order.stop_value(), Some(1.10));

        let order = HistoricalOrder {
            stop_loss: 0.0,
            stop_price: 1.20,
            ..Default::default()
        };
        assert_eq!(order.stop_value(), Some(1.20));

        let order = HistoricalOrder::default();
        assert_eq!(order.stop_value(), None);
    }

    #[test]
    fn order_decodes_last_update_field() {
        let order: HistoricalOrder = serde_json::from_value(serde_json::json!({
            "orderId": 7,
            "positionId": 3,
            "stopLoss": 1.5,
            "utcLastUpdateTimestamp": 1_700_000_000_000_i64,
            "tradeData": { "openTimestamp": 1_699_999_000_000_i64 }
        }))
        .unwrap();

        assert_eq!(order.order_id, 7);
        assert_eq!(order.last_update_timestamp, 1_700_000_000_000);
        assert_eq!(order.open_timestamp(), Some(1_699_999_000_000));
    }

    #[test]
    fn open_position_entry_price_fallback() {
        let snapshot = OpenPosition {
            price: 1.5,
            ..Default::default()
        };
        assert!((snapshot.entry_price() - 1.5).abs() < f64::EPSILON);

        let push = OpenPosition {
            price: 0.0,
            trade_data: PositionTradeData {
                entry_price: 2.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!((push.entry_price() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn execution_event_fill_filter() {
        let mut event = ExecutionEvent {
            execution_type: 2,
            ..Default::default()
        };
        assert!(event.is_fill());
        event.execution_type = 8;
        assert!(event.is_fill());
        event.execution_type = 5;
        assert!(!event.is_fill());
    }
}
