//! User-data stream lifecycle management
//!
//! One connection per account. The manager owns the connection state
//! machine, the ref-counted symbol subscriptions, the 30-minute
//! listen-key keepalive, and reconnect with jittered backoff. Normalized
//! events are forwarded into a single channel consumed by the fill
//! reconciler.

use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{AdapterRegistry, UserStreamEvent};
use crate::models::{Account, Id};

/// Listen-keys expire after 60 minutes on the slowest exchange; refresh
/// at half that.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Connection states. Only the transitions checked by
/// [`ConnState::can_transition_to`] are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    Reconnecting,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Disconnecting => "DISCONNECTING",
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Error => "ERROR",
            ConnState::Reconnecting => "RECONNECTING",
        }
    }

    pub fn can_transition_to(&self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Disconnecting)
                | (Connected, Error)
                | (Connected, Reconnecting)
                | (Disconnecting, Disconnected)
                | (Error, Reconnecting)
                | (Error, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
                | (Disconnected, Connecting)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct StreamHandle {
    state: std::sync::Mutex<ConnState>,
    /// symbol -> subscriber count.
    refcounts: DashMap<String, usize>,
    shutdown: watch::Sender<bool>,
}

impl StreamHandle {
    fn transition(&self, account_id: Id, next: ConnState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.can_transition_to(next) {
            tracing::debug!(account_id, from = %*state, to = %next, "User stream state");
            *state = next;
            true
        } else {
            tracing::warn!(
                account_id,
                from = %*state,
                to = %next,
                "Illegal user stream transition ignored"
            );
            false
        }
    }

    fn current(&self) -> ConnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Manages one user-data stream per account.
pub struct UserStreamManager {
    registry: Arc<AdapterRegistry>,
    handles: DashMap<Id, Arc<StreamHandle>>,
    /// Normalized events, tagged with the owning account.
    sink: mpsc::Sender<(Id, UserStreamEvent)>,
}

impl UserStreamManager {
    pub fn new(registry: Arc<AdapterRegistry>, sink: mpsc::Sender<(Id, UserStreamEvent)>) -> Self {
        Self {
            registry,
            handles: DashMap::new(),
            sink,
        }
    }

    pub fn connection_state(&self, account_id: Id) -> Option<ConnState> {
        self.handles.get(&account_id).map(|h| h.current())
    }

    /// Take one subscription reference on (account, symbol), spawning the
    /// account's stream task on first touch.
    pub fn subscribe_symbol(&self, account: &Account, symbol: &str) {
        let handle = self.ensure_stream(account);
        let mut count = handle.refcounts.entry(symbol.to_string()).or_insert(0);
        *count += 1;
        tracing::debug!(
            account_id = account.account_id,
            symbol,
            refcount = *count,
            "Symbol subscription added"
        );
    }

    /// Release one reference; at zero the symbol is dropped, and with no
    /// symbols left the connection is torn down.
    pub fn unsubscribe_symbol(&self, account_id: Id, symbol: &str) {
        let Some(handle) = self.handles.get(&account_id).map(|h| h.value().clone()) else {
            return;
        };
        let remove = {
            let Some(mut count) = handle.refcounts.get_mut(symbol) else {
                return;
            };
            *count = count.saturating_sub(1);
            *count == 0
        };
        if remove {
            handle.refcounts.remove(symbol);
        }
        if handle.refcounts.is_empty() {
            tracing::info!(account_id, "No subscriptions left; closing user stream");
            self.shutdown_account(account_id);
        }
    }

    /// Tear down one account's stream.
    pub fn shutdown_account(&self, account_id: Id) {
        if let Some((_, handle)) = self.handles.remove(&account_id) {
            handle.transition(account_id, ConnState::Disconnecting);
            let _ = handle.shutdown.send(true);
        }
    }

    /// Tear down everything (process shutdown).
    pub fn shutdown_all(&self) {
        let ids: Vec<Id> = self.handles.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.shutdown_account(id);
        }
    }

    fn ensure_stream(&self, account: &Account) -> Arc<StreamHandle> {
        use dashmap::mapref::entry::Entry;

        match self.handles.entry(account.account_id) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = Arc::new(StreamHandle {
                    state: std::sync::Mutex::new(ConnState::Disconnected),
                    refcounts: DashMap::new(),
                    shutdown: shutdown_tx,
                });
                slot.insert(handle.clone());

                let registry = self.registry.clone();
                let sink = self.sink.clone();
                let account = account.clone();
                let task_handle = handle.clone();
                tokio::spawn(async move {
                    run_stream(registry, account, task_handle, sink, shutdown_rx).await;
                });

                handle
            }
        }
    }
}

/// Per-account stream task: connect, forward, keepalive, reconnect.
async fn run_stream(
    registry: Arc<AdapterRegistry>,
    account: Account,
    handle: Arc<StreamHandle>,
    sink: mpsc::Sender<(Id, UserStreamEvent)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let account_id = account.account_id;
    let mut backoff = RECONNECT_BASE;

    loop {
        if *shutdown.borrow() {
            break;
        }
        handle.transition(account_id, ConnState::Connecting);

        let adapter = match registry.adapter_for(&account) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(account_id, error = %e, "No adapter for user stream");
                handle.transition(account_id, ConnState::Error);
                if wait_backoff(&mut shutdown, &mut backoff).await {
                    break;
                }
                handle.transition(account_id, ConnState::Reconnecting);
                continue;
            }
        };

        let mut events = match adapter.connect_user_stream().await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(account_id, error = %e, "User stream connect failed");
                handle.transition(account_id, ConnState::Error);
                if wait_backoff(&mut shutdown, &mut backoff).await {
                    break;
                }
                handle.transition(account_id, ConnState::Reconnecting);
                continue;
            }
        };

        handle.transition(account_id, ConnState::Connected);
        backoff = RECONNECT_BASE;
        tracing::info!(account_id, exchange = %adapter.exchange(), "User stream connected");

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately; skip it

        let disconnected = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break false;
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = adapter.keepalive_user_stream().await {
                        tracing::warn!(account_id, error = %e, "Listen-key keepalive failed");
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(UserStreamEvent::Disconnected { reason }) => {
                            tracing::warn!(account_id, %reason, "User stream dropped");
                            break true;
                        }
                        Some(event) => {
                            if sink.send((account_id, event)).await.is_err() {
                                // Reconciler gone; process is shutting down.
                                break false;
                            }
                        }
                        None => break true,
                    }
                }
            }
        };

        if !disconnected {
            break;
        }
        handle.transition(account_id, ConnState::Reconnecting);
        if wait_backoff(&mut shutdown, &mut backoff).await {
            break;
        }
    }

    handle.transition(account_id, ConnState::Disconnecting);
    handle.transition(account_id, ConnState::Disconnected);
    tracing::info!(account_id, "User stream task ended");
}

/// Sleep the backoff (with jitter), doubling for next time. Returns true
/// when shutdown was requested during the wait.
async fn wait_backoff(shutdown: &mut watch::Receiver<bool>, backoff: &mut Duration) -> bool {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    let wait = *backoff + jitter;
    *backoff = (*backoff * 2).min(RECONNECT_MAX);

    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_transitions() {
        use ConnState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnecting.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_refcounted_subscriptions() {
        use crate::secrets::EnvSecretStore;
        let registry = Arc::new(AdapterRegistry::new(Arc::new(EnvSecretStore)));
        let (tx, _rx) = mpsc::channel(8);
        let manager = UserStreamManager::new(registry, tx);

        let account = Account {
            account_id: 7,
            owner_user_id: 1,
            display_name: "test".to_string(),
            exchange: crate::models::Exchange::Binance,
            market_type: crate::models::MarketType::Spot,
            is_testnet: true,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        manager.subscribe_symbol(&account, "BTC/USDT");
        manager.subscribe_symbol(&account, "BTC/USDT");
        manager.subscribe_symbol(&account, "ETH/USDT");
        assert!(manager.connection_state(7).is_some());

        manager.unsubscribe_symbol(7, "BTC/USDT");
        assert!(manager.connection_state(7).is_some());

        manager.unsubscribe_symbol(7, "BTC/USDT");
        manager.unsubscribe_symbol(7, "ETH/USDT");
        // Last reference gone: handle removed.
        assert!(manager.connection_state(7).is_none());
    }
}
