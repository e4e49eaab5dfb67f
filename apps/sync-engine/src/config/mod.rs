//! Engine configuration, loaded from environment variables.
//!
//! Every tuning constant of the reconciliation engine (attribution windows,
//! backfill horizons, paging, batch sizes, pacing delays, timeouts) is a
//! named, overridable field here rather than a magic sleep in the sync path.

use std::time::Duration;

/// Venue environment for one linked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VenueEnvironment {
    /// Live trading venue.
    #[default]
    Live,
    /// Demo trading venue.
    Demo,
}

impl VenueEnvironment {
    /// Parse environment from the accounts row value.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "demo" => Self::Demo,
            _ => Self::Live,
        }
    }

    /// Streaming endpoint for this environment.
    #[must_use]
    pub const fn endpoint(&self) -> &'static str {
        match self {
            Self::Live => "wss://live.ctraderapi.com:5036",
            Self::Demo => "wss://demo.ctraderapi.com:5036",
        }
    }

    /// Environment name as stored on the accounts row.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Demo => "demo",
        }
    }
}

/// Reconciliation tuning values.
///
/// The 60 s attribution window, the 25 h backfill horizon, the 15-day paging
/// window and the batch-commit size of 50 are empirically tuned values
/// carried over from the production sync; they are preserved as defaults
/// here, not re-derived.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Window around entry time within which a stop value may be accepted
    /// as the initial stop-loss (historical resync path).
    pub initial_stop_window_ms: i64,
    /// Same window for live open-position snapshots, which carry far less
    /// ambiguity.
    pub snapshot_stop_window_ms: i64,
    /// An order whose last update diverges from its creation time by more
    /// than this is classified as modified after creation.
    pub modified_threshold_ms: i64,
    /// Two stop prices closer than this are the same history entry.
    pub stop_epsilon: f64,
    /// Targeted backfill window before position entry.
    pub backfill_before_ms: i64,
    /// Targeted backfill window after position exit.
    pub backfill_after_ms: i64,
    /// Width of one historical page in days.
    pub page_days: i64,
    /// Number of historical pages fetched by a full resync.
    pub page_count: u32,
    /// Positions committed per store transaction.
    pub batch_size: usize,
    /// Bound on each request/response round trip.
    pub request_timeout: Duration,
    /// Pacing delay around the two auth calls.
    pub auth_pacing: Duration,
    /// Pacing delay between successive history-page fetches.
    pub page_pacing: Duration,
    /// Pacing delay before per-position lookups.
    pub lookup_pacing: Duration,
    /// Listener reconnect delay after a connection failure.
    pub listener_retry_delay: Duration,
    /// Grace delay after stopping a listener before a manual resync dials.
    pub listener_stop_grace: Duration,
    /// Client keepalive heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Period of the listener supervisor loop.
    pub supervisor_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            initial_stop_window_ms: 60_000,
            snapshot_stop_window_ms: 2_000,
            modified_threshold_ms: 60_000,
            stop_epsilon: 0.000_01,
            backfill_before_ms: 25 * 3_600_000,
            backfill_after_ms: 2 * 3_600_000,
            page_days: 15,
            page_count: 8,
            batch_size: 50,
            request_timeout: Duration::from_secs(10),
            auth_pacing: Duration::from_millis(500),
            page_pacing: Duration::from_millis(300),
            lookup_pacing: Duration::from_millis(10),
            listener_retry_delay: Duration::from_secs(10),
            listener_stop_grace: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(25),
            supervisor_interval: Duration::from_secs(30),
        }
    }
}

impl SyncSettings {
    /// Load settings from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_stop_window_ms: parse_env_i64(
                "SYNC_INITIAL_STOP_WINDOW_MS",
                defaults.initial_stop_window_ms,
            ),
            snapshot_stop_window_ms: parse_env_i64(
                "SYNC_SNAPSHOT_STOP_WINDOW_MS",
                defaults.snapshot_stop_window_ms,
            ),
            modified_threshold_ms: parse_env_i64(
                "SYNC_MODIFIED_THRESHOLD_MS",
                defaults.modified_threshold_ms,
            ),
            stop_epsilon: parse_env_f64("SYNC_STOP_EPSILON", defaults.stop_epsilon),
            backfill_before_ms: parse_env_i64(
                "SYNC_BACKFILL_BEFORE_MS",
                defaults.backfill_before_ms,
            ),
            backfill_after_ms: parse_env_i64("SYNC_BACKFILL_AFTER_MS", defaults.backfill_after_ms),
            page_days: parse_env_i64("SYNC_PAGE_DAYS", defaults.page_days),
            page_count: parse_env_u32("SYNC_PAGE_COUNT", defaults.page_count),
            batch_size: parse_env_usize("SYNC_BATCH_SIZE", defaults.batch_size),
            request_timeout: parse_env_duration_secs(
                "SYNC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout,
            ),
            auth_pacing: parse_env_duration_millis("SYNC_AUTH_PACING_MS", defaults.auth_pacing),
            page_pacing: parse_env_duration_millis("SYNC_PAGE_PACING_MS", defaults.page_pacing),
            lookup_pacing: parse_env_duration_millis(
                "SYNC_LOOKUP_PACING_MS",
                defaults.lookup_pacing,
            ),
            listener_retry_delay: parse_env_duration_secs(
                "SYNC_LISTENER_RETRY_SECS",
                defaults.listener_retry_delay,
            ),
            listener_stop_grace: parse_env_duration_millis(
                "SYNC_LISTENER_STOP_GRACE_MS",
                defaults.listener_stop_grace,
            ),
            heartbeat_interval: parse_env_duration_secs(
                "SYNC_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            supervisor_interval: parse_env_duration_secs(
                "SYNC_SUPERVISOR_INTERVAL_SECS",
                defaults.supervisor_interval,
            ),
        }
    }
}

/// Store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Path to the journal's SQLite database file.
    pub database_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: "./trade_journal.db".to_string(),
        }
    }
}

impl StoreSettings {
    /// Load store settings from `DB_PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("DB_PATH")
                .unwrap_or_else(|_| Self::default().database_path),
        }
    }

    /// SQLite connection URL for the configured path.
    #[must_use]
    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Store settings.
    pub store: StoreSettings,
    /// Reconciliation tuning values.
    pub sync: SyncSettings,
}

impl EngineConfig {
    /// Load the full configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            store: StoreSettings::from_env(),
            sync: SyncSettings::from_env(),
        }
    }
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parsing() {
        assert_eq!(
            VenueEnvironment::from_str_case_insensitive("demo"),
            VenueEnvironment::Demo
        );
        assert_eq!(
            VenueEnvironment::from_str_case_insensitive("DEMO"),
            VenueEnvironment::Demo
        );
        assert_eq!(
            VenueEnvironment::from_str_case_insensitive("live"),
            VenueEnvironment::Live
        );
        assert_eq!(
            VenueEnvironment::from_str_case_insensitive("anything"),
            VenueEnvironment::Live
        );
    }

    #[test]
    fn environment_endpoints_differ() {
        assert_ne!(
            VenueEnvironment::Live.endpoint(),
            VenueEnvironment::Demo.endpoint()
        );
        assert!(VenueEnvironment::Demo.endpoint().starts_with("wss://"));
    }

    #[test]
    fn sync_settings_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.initial_stop_window_ms, 60_000);
        assert_eq!(settings.snapshot_stop_window_ms, 2_000);
        assert_eq!(settings.backfill_before_ms, 90_000_000);
        assert_eq!(settings.page_days, 15);
        assert_eq!(settings.page_count, 8);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.supervisor_interval, Duration::from_secs(30));
    }

    #[test]
    fn store_settings_url() {
        let settings = StoreSettings {
            database_path: "/data/journal.db".to_string(),
        };
        assert_eq!(
            settings.database_url(),
            "sqlite:///data/journal.db?mode=rwc"
        );
    }
}
