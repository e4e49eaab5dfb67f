// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::too_many_lines,
        clippy::default_trait_access
    )
)]

//! Sync Engine - Broker History Reconciliation
//!
//! Long-lived protocol client that reconciles a venue's raw deal/order
//! history into the trade journal's relational store.
//!
//! # Architecture
//!
//! Data flows one direction:
//!
//! - [`venue`]: one authenticated WebSocket session per account; typed wire
//!   messages, request/response correlation, heartbeat filtering
//! - [`sync::instruments`]: lazy instrument id → (name, contract size)
//!   cache enriching raw volumes and prices into domain units
//! - [`sync::position`] + [`sync::stop_loss`]: derive trade records and
//!   stop-loss provenance from fragmented event history
//! - [`sync::orchestrator`] / [`sync::listener`] / [`sync::manager`]:
//!   manual full resync, continuous live listening, and the supervised
//!   per-account registry driving both
//! - [`store`]: accounts status surface and idempotent trade-row writes
//!
//! The excluded REST layer interacts with the engine only through
//! [`sync::manager::SyncManager`] (start manual sync, stop listener) and by
//! polling the accounts row status field.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Engine configuration from environment variables.
pub mod config;

/// Journal store access (accounts, trades).
pub mod store;

/// Reconciliation engine.
pub mod sync;

/// Tracing setup.
pub mod telemetry;

/// Venue protocol client.
pub mod venue;

pub use config::{EngineConfig, StoreSettings, SyncSettings, VenueEnvironment};
pub use store::{AccountStore, BrokerAccount, StoreError, TradeStore};
pub use sync::manager::SyncManager;
pub use venue::{TransportError, VenueSession};
