use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tracked assets. One push channel and one state slot exists per variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Xrp,
    Sol,
}

impl Asset {
    pub const ALL: [Asset; 4] = [Asset::Btc, Asset::Eth, Asset::Xrp, Asset::Sol];
    pub const COUNT: usize = Self::ALL.len();

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Btc => "BTC",
            Self::Eth => "ETH",
            Self::Xrp => "XRP",
            Self::Sol => "SOL",
        }
    }

    /// Lowercase form used in per-asset channel paths.
    pub fn channel_segment(self) -> &'static str {
        match self {
            Self::Btc => "btc",
            Self::Eth => "eth",
            Self::Xrp => "xrp",
            Self::Sol => "sol",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Btc => 0,
            Self::Eth => 1,
            Self::Xrp => 2,
            Self::Sol => 3,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Asset {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Self::Btc),
            "ETH" => Ok(Self::Eth),
            "XRP" => Ok(Self::Xrp),
            "SOL" => Ok(Self::Sol),
            other => Err(SyncError::UnknownAsset(other.to_string())),
        }
    }
}
