use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    Json(#[from] simd_json::Error),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
