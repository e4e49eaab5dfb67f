//! Stop-loss provenance resolution.
//!
//! A position's order history arrives fragmented across three discovery
//! paths: the bulk windowed order fetch done while paging history, a
//! targeted per-position fetch over a widened window, and a direct lookup of
//! the order that opened the position. No single path reliably carries
//! "this was the stop at entry" semantics, because brokers allow stop
//! modification before the first fill is even reported.
//!
//! The resolver therefore runs a priority cascade:
//!
//! 1. a positive stop on the directly-fetched opening order wins
//!    unconditionally;
//! 2. otherwise a bulk-history stop qualifies only when the order was not
//!    modified after creation and its attributed time falls within the
//!    configured window of position entry;
//! 3. otherwise the same rule over a targeted per-position backfill;
//! 4. otherwise the chronologically earliest stop seen, still subject to
//!    the entry window — when nothing qualifies the initial stop stays
//!    unset rather than guessed.
//!
//! Independently of initial-stop resolution, every distinct stop value seen
//! on any path is retained (deduplicated by price, earliest timestamp kept)
//! as an ordered audit history.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SyncSettings;
use crate::venue::messages::HistoricalOrder;
use crate::venue::TransportError;

/// A derived (price, earliest-seen-timestamp) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLossEntry {
    /// Stop price.
    pub price: f64,
    /// Earliest timestamp (ms) this price was observed at.
    pub time: i64,
}

/// Accumulates distinct stop values across discovery paths.
#[derive(Debug, Clone)]
pub struct StopLossTimeline {
    entries: Vec<StopLossEntry>,
    epsilon: f64,
}

impl StopLossTimeline {
    /// Create an empty timeline with the given price-dedup epsilon.
    #[must_use]
    pub const fn new(epsilon: f64) -> Self {
        Self {
            entries: Vec::new(),
            epsilon,
        }
    }

    /// Record an observation. Non-positive prices are ignored; a price
    /// within epsilon of an existing entry only lowers that entry's
    /// timestamp if the new observation is earlier.
    pub fn record(&mut self, price: f64, time: i64) {
        if price <= 0.0 {
            return;
        }
        for existing in &mut self.entries {
            if (existing.price - price).abs() < self.epsilon {
                if time < existing.time {
                    existing.time = time;
                }
                return;
            }
        }
        self.entries.push(StopLossEntry { price, time });
    }

    /// The chronologically earliest entry.
    #[must_use]
    pub fn earliest(&self) -> Option<StopLossEntry> {
        self.entries.iter().copied().min_by_key(|e| e.time)
    }

    /// Entries ordered by timestamp.
    #[must_use]
    pub fn sorted(&self) -> Vec<StopLossEntry> {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|e| e.time);
        sorted
    }

    /// Number of distinct prices recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of provenance resolution for one position.
#[derive(Debug, Clone, Default)]
pub struct ResolvedStops {
    /// The authoritative stop-loss in effect at position entry, when one
    /// could be determined.
    pub initial: Option<f64>,
    /// Full deduplicated stop history, ordered by timestamp.
    pub history: Vec<StopLossEntry>,
    /// Last stop value seen per order id, for exit-side stop fallback.
    pub by_order: HashMap<i64, f64>,
}

impl ResolvedStops {
    /// History serialized as a JSON array (always valid, possibly empty).
    #[must_use]
    pub fn history_json(&self) -> String {
        serde_json::to_string(&self.history).unwrap_or_else(|_| "[]".to_string())
    }

    /// Exit-side stop for a closing deal: the close-detail value wins, the
    /// last stop recorded against the deal's order id is the fallback.
    #[must_use]
    pub fn exit_stop(&self, close_detail_stop: f64, order_id: i64) -> Option<f64> {
        if close_detail_stop > 0.0 {
            Some(close_detail_stop)
        } else {
            self.by_order.get(&order_id).copied()
        }
    }
}

/// Async source of order evidence (direct lookup + targeted backfill).
///
/// Implemented by the venue-backed client; tests substitute a fake.
#[async_trait]
pub trait OrderEvidenceSource: Send {
    /// Fetch a single order directly by id.
    async fn order_details(
        &mut self,
        order_id: i64,
    ) -> Result<Option<HistoricalOrder>, TransportError>;

    /// Fetch all orders attached to a position over an explicit window.
    async fn orders_for_position(
        &mut self,
        position_id: i64,
        from_timestamp: i64,
        to_timestamp: i64,
    ) -> Result<Vec<HistoricalOrder>, TransportError>;
}

/// Whether an order was modified after creation: its last update diverges
/// from its reported creation time by more than the configured threshold.
/// Orders without a creation timestamp cannot be classified and count as
/// unmodified.
#[must_use]
pub fn is_modified(order: &HistoricalOrder, threshold_ms: i64) -> bool {
    order
        .open_timestamp()
        .is_some_and(|open| (order.last_update_timestamp - open).abs() > threshold_ms)
}

/// The point on the history timeline a stop observation is attributed to.
///
/// A modified order's present stop value became true at its last update; an
/// unmodified order's value has held since creation.
#[must_use]
pub fn attributed_time(order: &HistoricalOrder, threshold_ms: i64) -> i64 {
    match order.open_timestamp() {
        Some(open) if !is_modified(order, threshold_ms) => open,
        _ => order.last_update_timestamp,
    }
}

/// Stop-loss provenance resolver.
#[derive(Debug, Clone, Copy)]
pub struct StopLossResolver<'a> {
    settings: &'a SyncSettings,
}

impl<'a> StopLossResolver<'a> {
    /// Create a resolver over the configured tuning values.
    #[must_use]
    pub const fn new(settings: &'a SyncSettings) -> Self {
        Self { settings }
    }

    /// Resolve stop-loss provenance for one position.
    ///
    /// `bulk_history` is the position's slice of the windowed historical
    /// order fetch. `opening_order_id` is `None` for live snapshot
    /// positions, which carry no order ids. `window_ms` is the acceptance
    /// window around `entry_time` (60 s for the historical path, 2 s for
    /// snapshots).
    ///
    /// Evidence-source failures degrade to missing evidence: the resolver
    /// never fails a position, it resolves to a null initial stop instead.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve<S: OrderEvidenceSource>(
        &self,
        source: &mut S,
        position_id: i64,
        entry_time: i64,
        exit_time: i64,
        opening_order_id: Option<i64>,
        bulk_history: &[HistoricalOrder],
        window_ms: i64,
    ) -> ResolvedStops {
        let mut timeline = StopLossTimeline::new(self.settings.stop_epsilon);
        let mut by_order: HashMap<i64, f64> = HashMap::new();
        let mut initial: Option<f64> = None;

        // Pass 1: the opening order fetched directly, highest priority.
        if let Some(order_id) = opening_order_id {
            match source.order_details(order_id).await {
                Ok(Some(order)) => {
                    if let Some(stop) = order.stop_value() {
                        initial = Some(stop);
                        timeline.record(stop, entry_time);
                        by_order.insert(order_id, stop);
                        tracing::debug!(
                            position_id,
                            order_id,
                            stop,
                            "initial stop from opening order"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(position_id, order_id, error = %e, "opening order lookup failed");
                }
            }
        }

        // Pass 2: the bulk-fetched order history for this position.
        let mut history = bulk_history.to_vec();
        history.sort_by_key(|o| o.last_update_timestamp);
        self.scan(
            &history,
            entry_time,
            window_ms,
            opening_order_id,
            &mut initial,
            &mut timeline,
            &mut by_order,
        );

        // Pass 3: targeted per-position backfill over a widened window. Runs
        // unconditionally so the audit history covers orders the bulk pages
        // missed; the initial-stop rule inside stays gated on `initial`.
        match source
            .orders_for_position(
                position_id,
                entry_time - self.settings.backfill_before_ms,
                exit_time + self.settings.backfill_after_ms,
            )
            .await
        {
            Ok(mut orders) => {
                orders.sort_by_key(|o| o.last_update_timestamp);
                self.scan(
                    &orders,
                    entry_time,
                    window_ms,
                    opening_order_id,
                    &mut initial,
                    &mut timeline,
                    &mut by_order,
                );
            }
            Err(e) => {
                tracing::warn!(position_id, error = %e, "targeted order backfill failed");
            }
        }

        // Pass 4: earliest distinct value seen, still subject to the entry
        // window. Outside the window the initial stop stays unset.
        if initial.is_none() {
            if let Some(earliest) = timeline.earliest() {
                if (earliest.time - entry_time).abs() <= window_ms {
                    initial = Some(earliest.price);
                    tracing::debug!(
                        position_id,
                        stop = earliest.price,
                        "initial stop from earliest fallback"
                    );
                } else {
                    tracing::debug!(
                        position_id,
                        stop = earliest.price,
                        offset_ms = earliest.time - entry_time,
                        "earliest stop too far from entry, leaving initial unset"
                    );
                }
            }
        }

        ResolvedStops {
            initial,
            history: timeline.sorted(),
            by_order,
        }
    }

    /// Apply the modified/attribution/window rule to one batch of orders.
    #[allow(clippy::too_many_arguments)]
    fn scan(
        &self,
        orders: &[HistoricalOrder],
        entry_time: i64,
        window_ms: i64,
        opening_order_id: Option<i64>,
        initial: &mut Option<f64>,
        timeline: &mut StopLossTimeline,
        by_order: &mut HashMap<i64, f64>,
    ) {
        let threshold = self.settings.modified_threshold_ms;
        for order in orders {
            let Some(stop) = order.stop_value() else {
                continue;
            };
            let modified = is_modified(order, threshold);
            let time = attributed_time(order, threshold);

            timeline.record(stop, time);
            by_order.insert(order.order_id, stop);

            if opening_order_id == Some(order.order_id) {
                // Evidence from the order that opened the position is
                // authoritative regardless of timing.
                *initial = Some(stop);
            } else if initial.is_none() && !modified && (time - entry_time).abs() <= window_ms {
                *initial = Some(stop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: SyncSettings = SyncSettings {
        initial_stop_window_ms: 60_000,
        snapshot_stop_window_ms: 2_000,
        modified_threshold_ms: 60_000,
        stop_epsilon: 0.000_01,
        backfill_before_ms: 25 * 3_600_000,
        backfill_after_ms: 2 * 3_600_000,
        page_days: 15,
        page_count: 8,
        batch_size: 50,
        request_timeout: std::time::Duration::from_secs(10),
        auth_pacing: std::time::Duration::from_millis(0),
        page_pacing: std::time::Duration::from_millis(0),
        lookup_pacing: std::time::Duration::from_millis(0),
        listener_retry_delay: std::time::Duration::from_secs(10),
        listener_stop_grace: std::time::Duration::from_secs(1),
        heartbeat_interval: std::time::Duration::from_secs(25),
        supervisor_interval: std::time::Duration::from_secs(30),
    };

    const ENTRY: i64 = 1_700_000_000_000;

    struct FakeSource {
        details: HashMap<i64, HistoricalOrder>,
        targeted: Vec<HistoricalOrder>,
        fail_details: bool,
    }

    impl FakeSource {
        fn empty() -> Self {
            Self {
                details: HashMap::new(),
                targeted: Vec::new(),
                fail_details: false,
            }
        }
    }

    #[async_trait]
    impl OrderEvidenceSource for FakeSource {
        async fn order_details(
            &mut self,
            order_id: i64,
        ) -> Result<Option<HistoricalOrder>, TransportError> {
            if self.fail_details {
                return Err(TransportError::Closed);
            }
            Ok(self.details.get(&order_id).cloned())
        }

        async fn orders_for_position(
            &mut self,
            _position_id: i64,
            _from_timestamp: i64,
            _to_timestamp: i64,
        ) -> Result<Vec<HistoricalOrder>, TransportError> {
            Ok(self.targeted.clone())
        }
    }

    fn make_order(order_id: i64, stop: f64, open: i64, update: i64) -> HistoricalOrder {
        HistoricalOrder {
            order_id,
            position_id: 1,
            stop_loss: stop,
            stop_price: 0.0,
            last_update_timestamp: update,
            trade_data: Some(crate::venue::messages::OrderTradeData {
                open_timestamp: open,
            }),
        }
    }

    #[test]
    fn timeline_deduplicates_within_epsilon() {
        let mut timeline = StopLossTimeline::new(0.000_01);
        timeline.record(1.2345, 100);
        timeline.record(1.234_500_001, 50);
        timeline.record(1.2346, 200);

        assert_eq!(timeline.len(), 2);
        // Earlier observation of the same price keeps the earlier timestamp.
        let sorted = timeline.sorted();
        assert_eq!(sorted[0].time, 50);
        assert!((sorted[0].price - 1.2345).abs() < 1e-9);
    }

    #[test]
    fn timeline_ignores_non_positive_prices() {
        let mut timeline = StopLossTimeline::new(0.000_01);
        timeline.record(0.0, 100);
        timeline.record(-1.0, 100);
        assert!(timeline.is_empty());
    }

    #[test]
    fn modified_classification() {
        let threshold = 60_000;

        let untouched = make_order(1, 1.5, ENTRY, ENTRY + 10_000);
        assert!(!is_modified(&untouched, threshold));
        assert_eq!(attributed_time(&untouched, threshold), ENTRY);

        let touched = make_order(1, 1.5, ENTRY, ENTRY + 7_200_000);
        assert!(is_modified(&touched, threshold));
        assert_eq!(attributed_time(&touched, threshold), ENTRY + 7_200_000);

        // No creation timestamp: cannot classify, attributed to last update.
        let bare = HistoricalOrder {
            order_id: 1,
            stop_loss: 1.5,
            last_update_timestamp: ENTRY + 500,
            ..Default::default()
        };
        assert!(!is_modified(&bare, threshold));
        assert_eq!(attributed_time(&bare, threshold), ENTRY + 500);
    }

    #[tokio::test]
    async fn direct_fetch_wins_over_bulk_evidence() {
        let mut source = FakeSource::empty();
        source
            .details
            .insert(10, make_order(10, 1900.0, ENTRY, ENTRY));

        // Conflicting bulk entry two hours after entry.
        let bulk = vec![make_order(11, 1920.0, ENTRY + 7_200_000, ENTRY + 7_200_000)];

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY + 3_600_000, Some(10), &bulk, 60_000)
            .await;

        assert_eq!(resolved.initial, Some(1900.0));
        assert_eq!(resolved.history.len(), 2);
    }

    #[tokio::test]
    async fn bulk_order_within_window_becomes_initial() {
        let mut source = FakeSource::empty();
        let bulk = vec![make_order(20, 1.1050, ENTRY + 5_000, ENTRY + 5_000)];

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY + 1_000_000, None, &bulk, 60_000)
            .await;

        assert_eq!(resolved.initial, Some(1.1050));
    }

    #[tokio::test]
    async fn modified_order_is_never_auto_selected() {
        let mut source = FakeSource::empty();
        // Created at entry but updated 2h later: classified modified, its
        // attributed time falls outside the window.
        let bulk = vec![make_order(30, 1.2000, ENTRY, ENTRY + 7_200_000)];

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY + 10_000_000, None, &bulk, 60_000)
            .await;

        assert_eq!(resolved.initial, None);
        // The value still lands in the audit history, at its update time.
        assert_eq!(resolved.history.len(), 1);
        assert_eq!(resolved.history[0].time, ENTRY + 7_200_000);
    }

    #[tokio::test]
    async fn targeted_backfill_resolves_when_bulk_is_empty() {
        let mut source = FakeSource::empty();
        source.targeted = vec![make_order(40, 1.3000, ENTRY + 2_000, ENTRY + 2_000)];

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY + 1_000, None, &[], 60_000)
            .await;

        assert_eq!(resolved.initial, Some(1.3000));
    }

    #[tokio::test]
    async fn fallback_respects_entry_window() {
        let mut source = FakeSource::empty();
        // Two modified orders; the earliest attributed time is still outside
        // the 60s window, so nothing qualifies.
        let bulk = vec![
            make_order(50, 1.40, ENTRY, ENTRY + 300_000),
            make_order(51, 1.41, ENTRY, ENTRY + 600_000),
        ];

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY + 900_000, None, &bulk, 60_000)
            .await;

        assert_eq!(resolved.initial, None);
        assert_eq!(resolved.history.len(), 2);
    }

    #[tokio::test]
    async fn evidence_source_failure_degrades_to_unset() {
        let mut source = FakeSource::empty();
        source.fail_details = true;

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY, Some(10), &[], 60_000)
            .await;

        assert_eq!(resolved.initial, None);
        assert!(resolved.history.is_empty());
    }

    #[tokio::test]
    async fn opening_order_in_bulk_is_authoritative() {
        let mut source = FakeSource::empty();
        // The opening order only shows up in bulk history, modified and far
        // from entry; it still wins because it opened the position.
        let bulk = vec![make_order(60, 1.5000, ENTRY, ENTRY + 7_200_000)];

        let resolver = StopLossResolver::new(&SETTINGS);
        let resolved = resolver
            .resolve(&mut source, 1, ENTRY, ENTRY + 8_000_000, Some(60), &bulk, 60_000)
            .await;

        assert_eq!(resolved.initial, Some(1.5000));
    }

    #[test]
    fn history_json_is_always_an_array() {
        let resolved = ResolvedStops::default();
        assert_eq!(resolved.history_json(), "[]");

        let resolved = ResolvedStops {
            history: vec![StopLossEntry {
                price: 1.5,
                time: 10,
            }],
            ..Default::default()
        };
        let parsed: Vec<StopLossEntry> = serde_json::from_str(&resolved.history_json()).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn exit_stop_prefers_close_detail() {
        let mut resolved = ResolvedStops::default();
        resolved.by_order.insert(7, 1.25);

        assert_eq!(resolved.exit_stop(1.30, 7), Some(1.30));
        assert_eq!(resolved.exit_stop(0.0, 7), Some(1.25));
        assert_eq!(resolved.exit_stop(0.0, 8), None);
    }
}
