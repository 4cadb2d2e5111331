use crate::asset::Asset;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Connection status surfaced to readers for one asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub last_connected_at: Option<i64>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error: None,
            last_connected_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl CandleInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }
}

impl FromStr for CandleInterval {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(SyncError::InvalidConfig(format!(
                "unsupported candle interval '{other}'"
            ))),
        }
    }
}

/// Latest spot price for one asset; replaced wholesale on every update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    pub price: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Fold a live price into the forming candle.
    pub fn apply_price(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

/// Signal records plus volatility snapshot, replaced wholesale on each
/// update. The analytic payloads are opaque JSON, stored unmodified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalSet {
    pub contracts: Vec<OwnedValue>,
    pub volatility: OwnedValue,
}

/// Everything the dashboard reads for one asset. One slot per enumerated
/// asset exists for the process lifetime; empty slots are initial, never
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssetSlot {
    pub price: Option<PriceSample>,
    pub candles: Vec<Candle>,
    pub signals: Option<SignalSet>,
    pub connection: ConnectionStatus,
}

/// Push-channel frame, keyed by (asset, event kind).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PushMessage {
    Connected {
        asset: Asset,
        #[serde(default)]
        timestamp: Option<String>,
    },
    PriceUpdate {
        asset: Asset,
        price: f64,
        timestamp: String,
    },
    SignalsUpdate {
        asset: Asset,
        #[serde(default)]
        contracts: Vec<OwnedValue>,
        volatility: OwnedValue,
    },
}

pub fn parse_push_payload(payload: &mut [u8]) -> Result<PushMessage, SyncError> {
    let message: PushMessage = simd_json::serde::from_slice(payload)?;
    if let PushMessage::PriceUpdate { price, .. } = &message {
        if !price.is_finite() {
            return Err(SyncError::InvalidPayload(
                "price must be finite".to_string(),
            ));
        }
    }
    Ok(message)
}

/// Candle REST row: `[timestamp_ms, open, high, low, close, volume]`.
#[derive(Debug, Deserialize)]
pub struct CandleWire(pub i64, pub f64, pub f64, pub f64, pub f64, pub f64);

impl CandleWire {
    pub fn into_candle(self, interval_ms: i64, now_ms: i64) -> Result<Candle, SyncError> {
        let CandleWire(timestamp, open, high, low, close, volume) = self;
        if !open.is_finite()
            || !high.is_finite()
            || !low.is_finite()
            || !close.is_finite()
            || !volume.is_finite()
        {
            return Err(SyncError::InvalidPayload(
                "candle values must be finite".to_string(),
            ));
        }

        Ok(Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume: volume.max(0.0),
            is_closed: timestamp.saturating_add(interval_ms) <= now_ms,
        })
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
