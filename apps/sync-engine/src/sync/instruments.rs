//! Per-connection instrument reference data cache.
//!
//! Resolves instrument id to display name and contract size with
//! memoization; a batch lookup is issued only for ids not already cached.
//! Reference-data unavailability must never abort reconciliation, so lookup
//! failures degrade to named defaults instead of failing the caller.

use std::collections::HashMap;

use crate::venue::messages::{self, SymbolByIdRequest, SymbolList, SymbolsListRequest};
use crate::venue::VenueSession;

/// Contract size assumed when the venue did not report one.
pub const DEFAULT_CONTRACT_SIZE: i64 = 100_000;

/// Display name assumed when the venue did not report one.
pub const UNKNOWN_SYMBOL: &str = "Unknown";

/// Resolved instrument metadata in domain units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    /// Display name of the instrument.
    pub name: String,
    /// Units of base volume per lot.
    pub contract_size: i64,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            name: UNKNOWN_SYMBOL.to_string(),
            contract_size: DEFAULT_CONTRACT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    name: String,
    // 0 = metadata not fetched yet
    contract_size: i64,
}

/// Instrument id → metadata lookup with memoization.
#[derive(Debug, Default)]
pub struct InstrumentCache {
    entries: HashMap<i64, CacheEntry>,
}

impl InstrumentCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed display names from a whole-account symbol listing. The light
    /// listing carries no contract sizes, so seeded ids still qualify for a
    /// metadata fetch.
    pub fn seed_names(&mut self, list: &SymbolList) {
        for symbol in &list.symbol {
            let entry = self.entries.entry(symbol.symbol_id).or_default();
            if !symbol.symbol_name.is_empty() {
                entry.name = symbol.symbol_name.clone();
            }
        }
    }

    /// Resolve an instrument, substituting defaults for anything unknown.
    #[must_use]
    pub fn get(&self, symbol_id: i64) -> Instrument {
        self.entries
            .get(&symbol_id)
            .map_or_else(Instrument::default, |entry| Instrument {
                name: if entry.name.is_empty() {
                    UNKNOWN_SYMBOL.to_string()
                } else {
                    entry.name.clone()
                },
                contract_size: if entry.contract_size > 0 {
                    entry.contract_size
                } else {
                    DEFAULT_CONTRACT_SIZE
                },
            })
    }

    /// Ids from `symbol_ids` that still need a metadata fetch.
    fn missing_metadata(&self, symbol_ids: &[i64]) -> Vec<i64> {
        let mut needed: Vec<i64> = symbol_ids
            .iter()
            .copied()
            .filter(|id| {
                self.entries
                    .get(id)
                    .is_none_or(|entry| entry.contract_size == 0)
            })
            .collect();
        needed.sort_unstable();
        needed.dedup();
        needed
    }

    /// Fetch metadata for any of `symbol_ids` not already cached.
    ///
    /// A failed or undecodable lookup is logged and swallowed; affected ids
    /// resolve to defaults.
    pub async fn ensure(
        &mut self,
        session: &mut VenueSession,
        venue_account_id: i64,
        symbol_ids: &[i64],
    ) {
        let needed = self.missing_metadata(symbol_ids);
        if needed.is_empty() {
            return;
        }

        let reply = session
            .send(
                messages::SYMBOL_BY_ID_REQ,
                &SymbolByIdRequest {
                    ctid_trader_account_id: venue_account_id,
                    symbol_id: needed.clone(),
                },
            )
            .await;

        let list: SymbolList = match reply.map(|frame| frame.decode()) {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "undecodable instrument lookup reply, using defaults");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, ids = ?needed, "instrument lookup failed, using defaults");
                return;
            }
        };

        for symbol in &list.symbol {
            let entry = self.entries.entry(symbol.symbol_id).or_default();
            if !symbol.symbol_name.is_empty() {
                entry.name = symbol.symbol_name.clone();
            }
            entry.contract_size = symbol.lot_size;
        }
    }

    /// Prefetch display names for the whole account.
    pub async fn prefetch_names(&mut self, session: &mut VenueSession, venue_account_id: i64) {
        let reply = session
            .send(
                messages::SYMBOLS_LIST_REQ,
                &SymbolsListRequest {
                    ctid_trader_account_id: venue_account_id,
                },
            )
            .await;

        match reply.map(|frame| frame.decode::<SymbolList>()) {
            Ok(Ok(list)) => self.seed_names(&list),
            Ok(Err(e)) => tracing::warn!(error = %e, "undecodable symbol listing"),
            Err(e) => tracing::warn!(error = %e, "symbol listing failed"),
        }
    }
}
