//! Multi-asset streaming synchronization core for a live market
//! dashboard: per-asset push connections with watchdog and backoff, a
//! bounded retention policy across assets, REST candle backfill, and a
//! shared per-asset state store for independent readers.

pub mod asset;
pub mod backend;
mod backfill;
pub mod config;
mod connection;
pub mod error;
pub mod manager;
pub mod retry;
pub mod store;
pub mod types;

pub use asset::Asset;
pub use config::{SyncConfig, SyncSettings};
pub use error::SyncError;
pub use manager::StreamManager;
pub use retry::{request_with_retry, RetryOptions};
pub use store::{SharedStateStore, StoreUpdate};
pub use types::{
    AssetSlot, Candle, CandleInterval, ConnectionState, ConnectionStatus, PriceSample,
    PushMessage, SignalSet,
};
