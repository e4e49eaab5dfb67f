//! Hosted-terminal history import over REST.
//!
//! The journal's second broker path: accounts hosted behind a MetaApi-style
//! cloud terminal expose plain HTTPS endpoints instead of a streaming
//! session. The importer resolves the hosted account across several
//! provisioning endpoints (the vendor's base URL varies by region and
//! documentation era), fetches a fixed window of history deals with
//! server-side synchronization, folds in/out deals into positions and
//! inserts the closed ones. Dedup here is heuristic (account + symbol +
//! entry time + lot size); these records carry no venue ticket.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use crate::store::{AccountStore, StoreError, TradeStore};

/// Deal direction code for a sell fill.
const DEAL_TYPE_SELL: &str = "DEAL_TYPE_SELL";
/// Entry-type marker for a position-opening fill.
const DEAL_ENTRY_IN: &str = "DEAL_ENTRY_IN";
/// Entry-type marker for a position-closing fill.
const DEAL_ENTRY_OUT: &str = "DEAL_ENTRY_OUT";

/// Errors from the hosted-terminal import.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Network-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success API response.
    #[error("terminal API error (status {status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The configured login was not found in the user's account list.
    #[error("no hosted account found for login '{0}'")]
    AccountNotFound(String),

    /// The hosted account exists but is not deployed.
    #[error("hosted account not deployed (status: {0})")]
    NotDeployed(String),

    /// The terminal never finished synchronizing with the broker.
    #[error("history synchronization timed out; the hosted account may not be connected")]
    SyncTimeout,

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Importer configuration.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Provisioning endpoints tried in order when resolving the account.
    pub provisioning_endpoints: Vec<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// History window fetched, in days.
    pub history_days: i64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            provisioning_endpoints: vec![
                "https://mt-provisioning-api-v1.agiliumtrade.ai".to_string(),
                "https://mt-provisioning-api-v1.metaapi.cloud".to_string(),
                "https://mt-provisioning-api-v1.agiliumtrade.agiliumtrade.ai".to_string(),
            ],
            request_timeout: Duration::from_secs(30),
            history_days: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionedAccount {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    login: serde_json::Value,
    #[serde(default)]
    region: String,
    #[serde(default)]
    deployment_status: String,
}

impl ProvisionedAccount {
    /// The login field arrives as either a string or a number.
    fn login_matches(&self, needle: &str) -> bool {
        match &self.login {
            serde_json::Value::String(s) => s == needle,
            serde_json::Value::Number(n) => n.to_string() == needle,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDeal {
    #[serde(default)]
    symbol: String,
    #[serde(rename = "type", default)]
    deal_type: String,
    #[serde(default)]
    entry_type: String,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    commission: f64,
    #[serde(default)]
    swap: f64,
    time: DateTime<Utc>,
    #[serde(default)]
    position_id: String,
}

/// One closed position folded from hosted-terminal deals.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedTrade {
    /// Instrument symbol.
    pub symbol: String,
    /// Position direction string ("long"/"short").
    pub side: String,
    /// Entry price.
    pub entry_price: f64,
    /// Exit price.
    pub exit_price: f64,
    /// Volume in lots as reported by the terminal.
    pub lot_size: f64,
    /// Realized profit including commission and swap.
    pub pnl: f64,
    /// Entry time.
    pub entry_time: DateTime<Utc>,
    /// Exit time.
    pub exit_time: DateTime<Utc>,
    /// Provenance note.
    pub notes: String,
}

/// Fold a flat deal listing into closed positions.
///
/// Opening fills set side/entry attributes, closing fills set exit
/// attributes and accumulate profit. Positions without a closing fill are
/// dropped (the hosted path has no open-position model).
fn fold_deals(deals: Vec<HistoryDeal>) -> Vec<ImportedTrade> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Pending {
        symbol: String,
        side: String,
        entry_price: f64,
        exit_price: f64,
        lot_size: f64,
        pnl: f64,
        entry_time: Option<DateTime<Utc>>,
        exit_time: Option<DateTime<Utc>>,
    }

    let mut positions: BTreeMap<String, Pending> = BTreeMap::new();

    for deal in deals {
        let pending = positions.entry(deal.position_id.clone()).or_insert_with(|| Pending {
            symbol: deal.symbol.clone(),
            lot_size: deal.volume,
            ..Default::default()
        });

        if deal.entry_type == DEAL_ENTRY_IN {
            pending.side = if deal.deal_type == DEAL_TYPE_SELL {
                "short".to_string()
            } else {
                "long".to_string()
            };
            pending.entry_price = deal.price;
            pending.entry_time = Some(deal.time);
        } else if deal.entry_type == DEAL_ENTRY_OUT {
            pending.exit_price = deal.price;
            pending.exit_time = Some(deal.time);
            pending.pnl += deal.profit + deal.commission + deal.swap;
        }
    }

    positions
        .into_iter()
        .filter_map(|(position_id, p)| {
            let entry_time = p.entry_time?;
            let exit_time = p.exit_time?;
            Some(ImportedTrade {
                symbol: p.symbol,
                side: if p.side.is_empty() {
                    "long".to_string()
                } else {
                    p.side
                },
                entry_price: p.entry_price,
                exit_price: p.exit_price,
                lot_size: p.lot_size,
                pnl: p.pnl,
                entry_time,
                exit_time,
                notes: format!("MT5 Sync: Position {position_id}"),
            })
        })
        .collect()
}

/// Hosted-terminal history importer.
pub struct HistoryImporter {
    client: reqwest::Client,
    config: ImportConfig,
}

impl HistoryImporter {
    /// Build an importer; fails only if the HTTP client cannot be built.
    pub fn new(config: ImportConfig) -> Result<Self, ImportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ImportError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Run a history import for one account, recording the terminal status
    /// on the accounts row. Mirrors the manual-resync failure surface: the
    /// status/last-error fields are the only observable outcome.
    pub async fn sync_account(
        &self,
        accounts: &AccountStore,
        trades: &TradeStore,
        account_id: i64,
        login: &str,
        token: &str,
    ) {
        match self.import(trades, account_id, login, token).await {
            Ok(inserted) => {
                tracing::info!(account_id, inserted, "hosted-terminal import succeeded");
                let _ = accounts.mark_success(account_id).await;
            }
            Err(e) => {
                tracing::error!(account_id, error = %e, "hosted-terminal import failed");
                let _ = accounts.mark_failed(account_id, &e.to_string()).await;
            }
        }
    }

    async fn import(
        &self,
        trades: &TradeStore,
        account_id: i64,
        login: &str,
        token: &str,
    ) -> Result<usize, ImportError> {
        let account = self.resolve_account(login, token).await?;
        let region = if account.region.is_empty() {
            "new-york".to_string()
        } else {
            account.region.clone()
        };

        let now = Utc::now();
        let start = (now - chrono::Duration::days(self.config.history_days))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let end = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let url = format!(
            "https://mt-client-api-v1.{region}.agiliumtrade.ai/users/current/accounts/{}/history-deals/time/{start}/{end}?wait-for-synchronization=true",
            account.id
        );

        tracing::debug!(account_id, region = %region, "fetching hosted-terminal history");
        let response = self
            .client
            .get(&url)
            .header("auth-token", token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ImportError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 504 {
            return Err(ImportError::SyncTimeout);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImportError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let deals: Vec<HistoryDeal> = response
            .json()
            .await
            .map_err(|e| ImportError::Network(e.to_string()))?;

        let mut inserted = 0usize;
        for trade in fold_deals(deals) {
            match trades.insert_imported_if_absent(account_id, &trade).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(account_id, symbol = %trade.symbol, error = %e, "import insert failed");
                }
            }
        }
        Ok(inserted)
    }

    /// Find the hosted account matching `login` by id or login, trying each
    /// provisioning endpoint in order.
    async fn resolve_account(
        &self,
        login: &str,
        token: &str,
    ) -> Result<ProvisionedAccount, ImportError> {
        let mut last_err: Option<ImportError> = None;

        for base in &self.config.provisioning_endpoints {
            let url = format!("{base}/users/current/accounts");
            let response = match self
                .client
                .get(&url)
                .header("auth-token", token)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(endpoint = %base, error = %e, "provisioning endpoint unreachable");
                    last_err = Some(ImportError::Network(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                last_err = Some(ImportError::Api {
                    status: status.as_u16(),
                    body,
                });
                continue;
            }

            let accounts: Vec<ProvisionedAccount> = match response.json().await {
                Ok(list) => list,
                Err(e) => {
                    last_err = Some(ImportError::Network(e.to_string()));
                    continue;
                }
            };

            if let Some(account) = accounts
                .into_iter()
                .find(|a| a.id == login || a.login_matches(login))
            {
                if account.deployment_status != "DEPLOYED" {
                    return Err(ImportError::NotDeployed(account.deployment_status));
                }
                return Ok(account);
            }
        }

        Err(last_err.unwrap_or_else(|| ImportError::AccountNotFound(login.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_deal(
        position_id: &str,
        entry_type: &str,
        deal_type: &str,
        price: f64,
        profit: f64,
    ) -> HistoryDeal {
        HistoryDeal {
            symbol: "EURUSD".to_string(),
            deal_type: deal_type.to_string(),
            entry_type: entry_type.to_string(),
            volume: 0.5,
            price,
            profit,
            commission: -1.0,
            swap: 0.0,
            time: Utc::now(),
            position_id: position_id.to_string(),
        }
    }

    #[test]
    fn folding_pairs_in_and_out_deals() {
        let deals = vec![
            make_deal("p1", DEAL_ENTRY_IN, "DEAL_TYPE_BUY", 1.1000, 0.0),
            make_deal("p1", DEAL_ENTRY_OUT, DEAL_TYPE_SELL, 1.1050, 25.0),
        ];

        let trades = fold_deals(deals);
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.side, "long");
        assert!((trade.entry_price - 1.1000).abs() < f64::EPSILON);
        assert!((trade.exit_price - 1.1050).abs() < f64::EPSILON);
        // profit + commission + swap, commission applied on the out deal only
        assert!((trade.pnl - 24.0).abs() < 1e-9);
        assert!(trade.notes.contains("p1"));
    }

    #[test]
    fn sell_opening_deal_is_short() {
        let deals = vec![
            make_deal("p2", DEAL_ENTRY_IN, DEAL_TYPE_SELL, 1.2000, 0.0),
            make_deal("p2", DEAL_ENTRY_OUT, "DEAL_TYPE_BUY", 1.1900, 50.0),
        ];

        let trades = fold_deals(deals);
        assert_eq!(trades[0].side, "short");
    }

    #[test]
    fn open_positions_are_dropped() {
        let deals = vec![make_deal("p3", DEAL_ENTRY_IN, "DEAL_TYPE_BUY", 1.0, 0.0)];
        assert!(fold_deals(deals).is_empty());
    }

    #[test]
    fn multiple_out_deals_accumulate_profit() {
        let deals = vec![
            make_deal("p4", DEAL_ENTRY_IN, "DEAL_TYPE_BUY", 1.0, 0.0),
            make_deal("p4", DEAL_ENTRY_OUT, DEAL_TYPE_SELL, 1.1, 10.0),
            make_deal("p4", DEAL_ENTRY_OUT, DEAL_TYPE_SELL, 1.2, 20.0),
        ];

        let trades = fold_deals(deals);
        assert_eq!(trades.len(), 1);
        // Two out deals, each with -1.0 commission.
        assert!((trades[0].pnl - 28.0).abs() < 1e-9);
        // Last out deal wins the exit attributes.
        assert!((trades[0].exit_price - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn login_matching_handles_string_and_number() {
        let mut account = ProvisionedAccount {
            id: "abc".to_string(),
            login: serde_json::json!("12345"),
            region: String::new(),
            deployment_status: "DEPLOYED".to_string(),
        };
        assert!(account.login_matches("12345"));

        account.login = serde_json::json!(12345);
        assert!(account.login_matches("12345"));
        assert!(!account.login_matches("999"));
    }
}
