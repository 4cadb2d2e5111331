use crate::asset::Asset;
use crate::error::SyncError;
use crate::types::{now_unix_ms, Candle, CandleInterval, CandleWire};
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn push_endpoint(base_url: &str, asset: Asset) -> String {
    format!("{base_url}/stream/{}", asset.channel_segment())
}

fn candles_endpoint(base_url: &str, asset: Asset, interval: CandleInterval, limit: u16) -> String {
    format!(
        "{base_url}/api/v1/candles/{}?interval={}&limit={limit}",
        asset.symbol(),
        interval.as_str()
    )
}

pub async fn connect_push_channel(base_url: &str, asset: Asset) -> Result<PushStream, SyncError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let request = push_endpoint(base_url, asset);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_candle_history(
    client: &Client,
    base_url: &str,
    asset: Asset,
    interval: CandleInterval,
    limit: u16,
) -> Result<Vec<Candle>, SyncError> {
    let endpoint = candles_endpoint(base_url, asset, interval, limit);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let mut payload = response.json::<Vec<CandleWire>>().await?;

    payload.sort_unstable_by_key(|row| row.0);
    payload.dedup_by_key(|row| row.0);

    let interval_ms = interval.duration_ms();
    let now_ms = now_unix_ms();
    let mut candles = Vec::with_capacity(payload.len());
    for row in payload {
        candles.push(row.into_candle(interval_ms, now_ms)?);
    }
    Ok(candles)
}
