use crate::asset::Asset;
use crate::backfill::{spawn_backfill_poller, PollerHandle};
use crate::config::SyncConfig;
use crate::connection::{spawn_connection, ConnectionHandle, IdleTimer};
use crate::store::SharedStateStore;
use crate::types::ConnectionState;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Selection bookkeeping shared with connection actors and idle timers:
/// the currently selected asset and the most recently previously selected
/// one. Handles outside this pair are pruned after the idle grace period
/// and their failures are never retried.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RetentionState {
    pub selected: Option<Asset>,
    pub last_active: Option<Asset>,
}

impl RetentionState {
    pub fn is_retained(&self, asset: Asset) -> bool {
        self.selected == Some(asset) || self.last_active == Some(asset)
    }
}

type HandleMap = Arc<Mutex<HashMap<Asset, ConnectionHandle>>>;

/// Orchestrates per-asset push connections: opens or reuses handles on
/// selection, keeps at most the selected and last-active assets retained,
/// prunes everything else after the idle grace period, and owns the
/// backfill poller lifecycle.
pub struct StreamManager {
    config: Arc<SyncConfig>,
    store: Arc<SharedStateStore>,
    http_client: Client,
    handles: HandleMap,
    retention: Arc<RwLock<RetentionState>>,
    selected_tx: watch::Sender<Option<Asset>>,
    poller: Mutex<Option<PollerHandle>>,
}

impl StreamManager {
    pub fn new(config: SyncConfig, store: Arc<SharedStateStore>) -> Self {
        let (selected_tx, _) = watch::channel(None);
        Self {
            config: Arc::new(config),
            store,
            http_client: Client::new(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            retention: Arc::new(RwLock::new(RetentionState::default())),
            selected_tx,
            poller: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<SharedStateStore> {
        Arc::clone(&self.store)
    }

    /// Starts the backfill poller. Calling it again is a no-op while the
    /// poller is running.
    pub fn start(&self) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        *poller = Some(spawn_backfill_poller(
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            self.http_client.clone(),
            self.selected_tx.subscribe(),
        ));
        info!("backfill poller started");
    }

    /// Stops the poller and tears down every connection.
    pub async fn stop(&self) {
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.cancel.cancel();
            let _ = poller.task.await;
        }
        self.disconnect_all().await;
        info!("stream manager stopped");
    }

    /// Marks `asset` as selected and ensures a live handle exists for it.
    /// Reselecting an asset with a pending idle timer cancels the timer
    /// instead of opening a duplicate handle.
    pub fn connect_asset(&self, asset: Asset) {
        {
            let mut retention = self.retention.write();
            retention.selected = Some(asset);
        }
        self.ensure_handle(asset);
        self.selected_tx.send_replace(Some(asset));
        self.prune_idle();
    }

    /// Like [`Self::connect_asset`], additionally recording the asset
    /// being switched away from as last-active.
    pub fn switch_asset(&self, asset: Asset) {
        {
            let mut retention = self.retention.write();
            if retention.selected != Some(asset) {
                retention.last_active = retention.selected;
                retention.selected = Some(asset);
            }
        }
        self.ensure_handle(asset);
        self.selected_tx.send_replace(Some(asset));
        self.prune_idle();
    }

    pub async fn disconnect_asset(&self, asset: Asset) {
        {
            let mut retention = self.retention.write();
            if retention.selected == Some(asset) {
                retention.selected = None;
            }
            if retention.last_active == Some(asset) {
                retention.last_active = None;
            }
        }
        if self.retention.read().selected.is_none() {
            self.selected_tx.send_replace(None);
        }

        let handle = self.handles.lock().remove(&asset);
        if let Some(handle) = handle {
            teardown_handle(asset, handle, &self.store).await;
        }
    }

    pub async fn disconnect_all(&self) {
        *self.retention.write() = RetentionState::default();
        self.selected_tx.send_replace(None);

        let drained: Vec<(Asset, ConnectionHandle)> =
            self.handles.lock().drain().collect();
        for (asset, handle) in drained {
            teardown_handle(asset, handle, &self.store).await;
        }
    }

    pub fn selected(&self) -> Option<Asset> {
        self.retention.read().selected
    }

    pub fn last_active(&self) -> Option<Asset> {
        self.retention.read().last_active
    }

    /// Assets whose connection actor is still running.
    pub fn live_assets(&self) -> Vec<Asset> {
        self.handles
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(asset, _)| *asset)
            .collect()
    }

    pub fn open_handle_count(&self) -> usize {
        self.live_assets().len()
    }

    fn ensure_handle(&self, asset: Asset) {
        let mut handles = self.handles.lock();
        let warm = match handles.get_mut(&asset) {
            Some(handle) if !handle.is_finished() => {
                // Idempotent reconnect: keep the warm handle, just cancel
                // any pending idle-disconnect timer.
                handle.cancel_idle();
                true
            }
            _ => false,
        };
        if warm {
            return;
        }

        // Either no handle, or its actor gave up while the asset was
        // idle; discard and reopen.
        if let Some(mut stale) = handles.remove(&asset) {
            stale.cancel_idle();
            stale.cancel.cancel();
        }

        debug!(%asset, "opening push connection");
        handles.insert(
            asset,
            spawn_connection(
                asset,
                Arc::clone(&self.config),
                Arc::clone(&self.store),
                Arc::clone(&self.retention),
            ),
        );
    }

    /// Schedules an idle-disconnect timer for every handle outside the
    /// retained pair; cancels stray timers on retained handles.
    fn prune_idle(&self) {
        let retention = *self.retention.read();
        let mut handles = self.handles.lock();
        for (asset, handle) in handles.iter_mut() {
            if retention.is_retained(*asset) {
                handle.cancel_idle();
                continue;
            }
            if handle.idle.is_some() {
                continue;
            }
            handle.idle = Some(schedule_idle_disconnect(
                *asset,
                self.config.idle_grace,
                Arc::clone(&self.handles),
                Arc::clone(&self.retention),
                Arc::clone(&self.store),
            ));
        }
    }
}

async fn teardown_handle(asset: Asset, mut handle: ConnectionHandle, store: &SharedStateStore) {
    handle.cancel_idle();
    handle.cancel.cancel();
    let _ = handle.task.await;
    store.set_connection_state(asset, ConnectionState::Disconnected, None);
    debug!(%asset, "connection handle torn down");
}

fn schedule_idle_disconnect(
    asset: Asset,
    grace: std::time::Duration,
    handles: HandleMap,
    retention: Arc<RwLock<RetentionState>>,
    store: Arc<SharedStateStore>,
) -> IdleTimer {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }

        let handle = {
            let mut handles = handles.lock();
            // A reselection may have raced the sleep; its cancel happens
            // under this same lock, so re-check before committing.
            if token.is_cancelled() || retention.read().is_retained(asset) {
                return;
            }
            handles.remove(&asset)
        };

        if let Some(mut handle) = handle {
            handle.idle = None;
            handle.cancel.cancel();
            let _ = handle.task.await;
            store.set_connection_state(asset, ConnectionState::Disconnected, None);
            debug!(%asset, "idle connection pruned");
        }
    });

    IdleTimer { cancel, task }
}
