//! Listener registry and supervision.
//!
//! Owns the account id → live session registry behind a read/write lock and
//! reconciles it periodically against the set of accounts that *should* have
//! a listener (broker-linked, not currently mid-manual-sync): missing ones
//! are started, orphaned ones stopped. Manual resyncs are fire-and-forget
//! tasks that preempt the account's listener first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{listener, orchestrator};
use crate::config::SyncSettings;
use crate::store::{AccountStore, BrokerAccount, TradeStore};

struct ListenerHandle {
    cancel: CancellationToken,
}

/// Registry of live listeners plus the manual-sync entry point.
///
/// Injected into the service lifecycle instead of living as process-global
/// state; all mutation goes through the internal lock.
pub struct SyncManager {
    accounts: AccountStore,
    trades: TradeStore,
    settings: SyncSettings,
    listeners: RwLock<HashMap<i64, ListenerHandle>>,
}

impl SyncManager {
    /// Create a manager over the shared store handles.
    #[must_use]
    pub fn new(accounts: AccountStore, trades: TradeStore, settings: SyncSettings) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            trades,
            settings,
            listeners: RwLock::new(HashMap::new()),
        })
    }

    /// Supervisor loop: reconcile the listener registry on a fixed period
    /// until shutdown, then stop every listener.
    pub async fn run_supervisor(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.supervisor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => self.reconcile_listeners().await,
            }
        }

        self.stop_all().await;
        tracing::info!("listener supervisor stopped");
    }

    /// One reconciliation pass over the registry.
    pub async fn reconcile_listeners(&self) {
        let linked = match self.accounts.broker_linked().await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(error = %e, "account listing failed, skipping supervisor pass");
                return;
            }
        };

        // Accounts mid-manual-sync must not have a competing writer.
        let desired: HashMap<i64, BrokerAccount> = linked
            .into_iter()
            .filter(|account| !account.is_syncing())
            .map(|account| (account.id, account))
            .collect();

        let mut listeners = self.listeners.write().await;

        listeners.retain(|account_id, handle| {
            if desired.contains_key(account_id) {
                true
            } else {
                tracing::info!(account_id, "stopping orphaned listener");
                handle.cancel.cancel();
                false
            }
        });

        for (account_id, account) in desired {
            if listeners.contains_key(&account_id) {
                continue;
            }
            let cancel = CancellationToken::new();
            tokio::spawn(listener::run_listener(
                self.trades.clone(),
                self.settings.clone(),
                account,
                cancel.clone(),
            ));
            listeners.insert(account_id, ListenerHandle { cancel });
        }
    }

    /// Whether a listener is registered for the account.
    pub async fn is_listening(&self, account_id: i64) -> bool {
        self.listeners.read().await.contains_key(&account_id)
    }

    /// Stop the account's listener. Idempotent: unknown accounts are a
    /// no-op. The listener's event loop exits at its next poll cycle.
    pub async fn stop_listener(&self, account_id: i64) {
        if let Some(handle) = self.listeners.write().await.remove(&account_id) {
            handle.cancel.cancel();
            tracing::info!(account_id, "listener stop requested");
        }
    }

    /// Stop every listener (shutdown path).
    pub async fn stop_all(&self) {
        let mut listeners = self.listeners.write().await;
        for (account_id, handle) in listeners.drain() {
            tracing::debug!(account_id, "stopping listener on shutdown");
            handle.cancel.cancel();
        }
    }

    /// Kick off a manual full resync for the account. Fire-and-forget: the
    /// caller observes progress by polling the account's status field.
    ///
    /// Any live listener for the account is stopped first and given a short
    /// grace period to release its socket, so two writers never race on the
    /// same ticket space.
    pub fn start_manual_sync(self: Arc<Self>, account_id: i64) {
        let manager = self;
        tokio::spawn(async move {
            let account = match manager.accounts.broker_account(account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => {
                    tracing::warn!(account_id, "manual sync requested for unlinked account");
                    return;
                }
                Err(e) => {
                    tracing::error!(account_id, error = %e, "account lookup failed");
                    let _ = manager
                        .accounts
                        .mark_failed(account_id, &e.to_string())
                        .await;
                    return;
                }
            };

            manager.stop_listener(account_id).await;
            tokio::time::sleep(manager.settings.listener_stop_grace).await;

            orchestrator::run_manual_sync(
                &manager.accounts,
                &manager.trades,
                &manager.settings,
                &account,
            )
            .await;
        });
    }

    #[cfg(test)]
    async fn inject_handle(&self, account_id: i64) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.listeners.write().await.insert(
            account_id,
            ListenerHandle {
                cancel: cancel.clone(),
            },
        );
        cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::make_pool;

    async fn make_manager() -> Arc<SyncManager> {
        let pool = make_pool().await;
        SyncManager::new(
            AccountStore::new(pool.clone()),
            TradeStore::new(pool),
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn stop_listener_is_idempotent() {
        let manager = make_manager().await;

        // Unknown account: no-op.
        manager.stop_listener(99).await;

        let cancel = manager.inject_handle(1).await;
        assert!(manager.is_listening(1).await);

        manager.stop_listener(1).await;
        assert!(!manager.is_listening(1).await);
        assert!(cancel.is_cancelled());

        // Second stop is still a no-op.
        manager.stop_listener(1).await;
    }

    #[tokio::test]
    async fn stop_all_cancels_every_handle() {
        let manager = make_manager().await;
        let c1 = manager.inject_handle(1).await;
        let c2 = manager.inject_handle(2).await;

        manager.stop_all().await;

        assert!(c1.is_cancelled());
        assert!(c2.is_cancelled());
        assert!(!manager.is_listening(1).await);
        assert!(!manager.is_listening(2).await);
    }

    #[tokio::test]
    async fn supervisor_pass_stops_orphaned_listeners() {
        let manager = make_manager().await;

        // Registered listener for an account that is not broker-linked.
        let cancel = manager.inject_handle(42).await;
        manager.reconcile_listeners().await;

        assert!(cancel.is_cancelled());
        assert!(!manager.is_listening(42).await);
    }
}
