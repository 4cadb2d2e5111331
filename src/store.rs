use crate::asset::Asset;
use crate::types::{
    now_unix_ms, AssetSlot, Candle, ConnectionState, ConnectionStatus, PriceSample, SignalSet,
};
use parking_lot::RwLock;
use simd_json::OwnedValue;
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Change notification pushed to subscribed readers. Carries only the
/// asset and the kind of change; readers pull the data they need through
/// the snapshot accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUpdate {
    PriceChanged { asset: Asset },
    CandlesChanged { asset: Asset },
    SignalsChanged { asset: Asset },
    ConnectionChanged { asset: Asset, state: ConnectionState },
}

/// Single source of truth per asset. Writers go through the mutation
/// methods below (one short write lock per call, one slot per asset, so a
/// write never touches another asset's slot); readers clone snapshots or
/// subscribe to the update feed and never block writers beyond the lock.
#[derive(Debug)]
pub struct SharedStateStore {
    slots: [RwLock<AssetSlot>; Asset::COUNT],
    updates: broadcast::Sender<StoreUpdate>,
}

impl Default for SharedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStateStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            slots: std::array::from_fn(|_| RwLock::new(AssetSlot::default())),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    fn slot(&self, asset: Asset) -> &RwLock<AssetSlot> {
        &self.slots[asset.index()]
    }

    fn publish(&self, update: StoreUpdate) {
        let _ = self.updates.send(update);
    }

    pub fn set_price(&self, asset: Asset, price: f64, timestamp: impl Into<String>) {
        {
            let mut slot = self.slot(asset).write();
            slot.price = Some(PriceSample {
                price,
                timestamp: timestamp.into(),
            });
        }
        self.publish(StoreUpdate::PriceChanged { asset });
    }

    /// Wholesale candle replacement, used for cold load and forced resync.
    /// Every element but the trailing one is sealed; the trailing element
    /// becomes the provisional last candle.
    pub fn set_candles(&self, asset: Asset, mut candles: Vec<Candle>) {
        let count = candles.len();
        for candle in candles.iter_mut().take(count.saturating_sub(1)) {
            candle.is_closed = true;
        }
        {
            let mut slot = self.slot(asset).write();
            slot.candles = candles;
        }
        self.publish(StoreUpdate::CandlesChanged { asset });
    }

    /// Appends one candle, sealing the previous trailing candle first.
    /// Sealed candles are never mutated afterwards.
    pub fn add_candle(&self, asset: Asset, candle: Candle) {
        {
            let mut slot = self.slot(asset).write();
            if let Some(last) = slot.candles.last_mut() {
                last.is_closed = true;
            }
            slot.candles.push(candle);
        }
        self.publish(StoreUpdate::CandlesChanged { asset });
    }

    /// Mutates the provisional open candle in place; never grows the
    /// sequence and never touches a sealed candle.
    pub fn update_last_candle(&self, asset: Asset, candle: Candle) {
        let changed = {
            let mut slot = self.slot(asset).write();
            match slot.candles.last_mut() {
                Some(last) if !last.is_closed => {
                    *last = candle;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish(StoreUpdate::CandlesChanged { asset });
        }
    }

    pub fn set_signals(&self, asset: Asset, contracts: Vec<OwnedValue>, volatility: OwnedValue) {
        {
            let mut slot = self.slot(asset).write();
            slot.signals = Some(SignalSet {
                contracts,
                volatility,
            });
        }
        self.publish(StoreUpdate::SignalsChanged { asset });
    }

    /// Sole writer of connection status. Stamps `last_connected_at` only
    /// on a transition into `Connected`.
    pub fn set_connection_state(
        &self,
        asset: Asset,
        state: ConnectionState,
        error: Option<String>,
    ) {
        {
            let mut slot = self.slot(asset).write();
            if state == ConnectionState::Connected
                && slot.connection.state != ConnectionState::Connected
            {
                slot.connection.last_connected_at = Some(now_unix_ms());
            }
            slot.connection.state = state;
            slot.connection.error = error;
        }
        self.publish(StoreUpdate::ConnectionChanged { asset, state });
    }

    pub fn snapshot(&self, asset: Asset) -> AssetSlot {
        self.slot(asset).read().clone()
    }

    pub fn price(&self, asset: Asset) -> Option<PriceSample> {
        self.slot(asset).read().price.clone()
    }

    pub fn candles(&self, asset: Asset) -> Vec<Candle> {
        self.slot(asset).read().candles.clone()
    }

    pub fn last_candle(&self, asset: Asset) -> Option<Candle> {
        self.slot(asset).read().candles.last().cloned()
    }

    pub fn signals(&self, asset: Asset) -> Option<SignalSet> {
        self.slot(asset).read().signals.clone()
    }

    pub fn connection(&self, asset: Asset) -> ConnectionStatus {
        self.slot(asset).read().connection.clone()
    }

    /// Restores every slot to its initial empty state.
    pub fn reset(&self) {
        for slot in &self.slots {
            *slot.write() = AssetSlot::default();
        }
    }
}
