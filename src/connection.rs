use crate::asset::Asset;
use crate::backend::connect_push_channel;
use crate::config::SyncConfig;
use crate::manager::RetentionState;
use crate::retry::backoff_delay;
use crate::store::SharedStateStore;
use crate::types::{parse_push_payload, ConnectionState, PushMessage};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pending idle-disconnect timer for a warm but non-retained handle.
#[derive(Debug)]
pub(crate) struct IdleTimer {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Manager-owned record for one asset's push connection: the actor task
/// plus its cancellation token and an optional pending idle timer. The
/// actor internally owns the transport, the reconnect-attempt counter and
/// the data-received flag; cancelling the token cancels every pending
/// timer the actor holds.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
    pub idle: Option<IdleTimer>,
}

impl ConnectionHandle {
    pub fn cancel_idle(&mut self) {
        if let Some(idle) = self.idle.take() {
            idle.cancel.cancel();
            idle.task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) fn spawn_connection(
    asset: Asset,
    config: Arc<SyncConfig>,
    store: Arc<SharedStateStore>,
    retention: Arc<RwLock<RetentionState>>,
) -> ConnectionHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_connection(
        asset,
        config,
        store,
        retention,
        cancel.clone(),
    ));
    ConnectionHandle {
        cancel,
        task,
        idle: None,
    }
}

enum StreamOutcome {
    Cancelled,
    Failed(String),
}

async fn run_connection(
    asset: Asset,
    config: Arc<SyncConfig>,
    store: Arc<SharedStateStore>,
    retention: Arc<RwLock<RetentionState>>,
    cancel: CancellationToken,
) {
    let mut attempts: u32 = 0;

    loop {
        let phase = if attempts == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        store.set_connection_state(asset, phase, None);

        match stream_until_failure(asset, &config, &store, &cancel, &mut attempts).await {
            StreamOutcome::Cancelled => {
                store.set_connection_state(asset, ConnectionState::Disconnected, None);
                debug!(%asset, "push channel disconnected");
                return;
            }
            StreamOutcome::Failed(reason) => {
                store.set_connection_state(asset, ConnectionState::Error, Some(reason.clone()));

                if !retention.read().is_retained(asset) {
                    // Idle assets are never retried; the handle stays in
                    // place until the idle timer prunes it.
                    debug!(%asset, %reason, "push channel failed while idle, not retrying");
                    return;
                }

                let delay =
                    backoff_delay(config.backoff_initial_delay, config.backoff_max_delay, attempts);
                let delay_ms = delay.as_millis() as u64;
                attempts = attempts.saturating_add(1);
                warn!(%asset, attempt = attempts, delay_ms, %reason, "push channel failed, reconnecting");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        store.set_connection_state(asset, ConnectionState::Disconnected, None);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Dials the push channel and pumps frames into the store until the
/// connection fails or the token is cancelled. The connection-timeout
/// watchdog spans both the dial and the wait for the first data frame;
/// the first decoded frame moves the asset to `connected` and resets the
/// attempt counter.
async fn stream_until_failure(
    asset: Asset,
    config: &SyncConfig,
    store: &SharedStateStore,
    cancel: &CancellationToken,
    attempts: &mut u32,
) -> StreamOutcome {
    let watchdog_deadline = Instant::now() + config.connection_timeout;
    let timeout_ms = config.connection_timeout.as_millis() as u64;

    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
        result = timeout_at(watchdog_deadline, connect_push_channel(&config.push_base_url, asset)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    return StreamOutcome::Failed(format!("push channel connect error: {error}"));
                }
                Err(_) => {
                    return StreamOutcome::Failed(format!(
                        "no connection within {timeout_ms} ms"
                    ));
                }
            }
        }
    };

    let mut received_data = false;
    loop {
        let frame = if received_data {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return StreamOutcome::Cancelled;
                }
                frame = stream.next() => frame,
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return StreamOutcome::Cancelled;
                }
                result = timeout_at(watchdog_deadline, stream.next()) => {
                    match result {
                        Ok(frame) => frame,
                        Err(_) => {
                            let _ = stream.close(None).await;
                            return StreamOutcome::Failed(format!(
                                "no data within {timeout_ms} ms of connecting"
                            ));
                        }
                    }
                }
            }
        };

        let Some(frame_result) = frame else {
            return StreamOutcome::Failed("push channel closed by server".to_string());
        };

        match frame_result {
            Ok(message) => match handle_frame(asset, store, message) {
                FrameDirective::Data => {
                    if !received_data {
                        received_data = true;
                        *attempts = 0;
                        store.set_connection_state(asset, ConnectionState::Connected, None);
                        debug!(%asset, "push channel connected");
                    }
                }
                FrameDirective::Ignored => {}
                FrameDirective::Closed => {
                    return StreamOutcome::Failed("push channel closed by server".to_string());
                }
            },
            Err(error) => {
                return StreamOutcome::Failed(format!("push channel frame error: {error}"));
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FrameDirective {
    /// A decoded data frame for this asset; counts as data receipt.
    Data,
    /// Control frame, undecodable payload, or a frame for another asset.
    Ignored,
    Closed,
}

fn handle_frame(asset: Asset, store: &SharedStateStore, message: Message) -> FrameDirective {
    let mut payload = match message {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(binary) => binary,
        Message::Close(_) => return FrameDirective::Closed,
        _ => return FrameDirective::Ignored,
    };

    match parse_push_payload(payload.as_mut_slice()) {
        Ok(parsed) => apply_push_message(asset, store, parsed),
        Err(error) => {
            warn!(%asset, %error, "failed to decode push frame");
            FrameDirective::Ignored
        }
    }
}

fn apply_push_message(
    asset: Asset,
    store: &SharedStateStore,
    message: PushMessage,
) -> FrameDirective {
    match message {
        PushMessage::Connected {
            asset: frame_asset, ..
        } => {
            if frame_asset != asset {
                warn!(%asset, frame_asset = %frame_asset, "ack frame for wrong asset");
                return FrameDirective::Ignored;
            }
            FrameDirective::Data
        }
        PushMessage::PriceUpdate {
            asset: frame_asset,
            price,
            timestamp,
        } => {
            if frame_asset != asset {
                warn!(%asset, frame_asset = %frame_asset, "price frame for wrong asset");
                return FrameDirective::Ignored;
            }
            store.set_price(asset, price, timestamp);
            refresh_open_candle(asset, store, price);
            FrameDirective::Data
        }
        PushMessage::SignalsUpdate {
            asset: frame_asset,
            contracts,
            volatility,
        } => {
            if frame_asset != asset {
                warn!(%asset, frame_asset = %frame_asset, "signals frame for wrong asset");
                return FrameDirective::Ignored;
            }
            store.set_signals(asset, contracts, volatility);
            FrameDirective::Data
        }
    }
}

/// Folds a live price into the trailing open candle. New buckets are
/// opened by the backfill poller, which remains the candle authority.
fn refresh_open_candle(asset: Asset, store: &SharedStateStore, price: f64) {
    if let Some(mut last) = store.last_candle(asset) {
        if !last.is_closed {
            last.apply_price(price);
            store.update_last_candle(asset, last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    fn text_frame(raw: &str) -> Message {
        Message::Text(raw.to_string())
    }

    #[test]
    fn price_frame_updates_price_and_counts_as_data() {
        let store = SharedStateStore::new();
        let directive = handle_frame(
            Asset::Btc,
            &store,
            text_frame(r#"{"event":"price_update","asset":"BTC","price":64000.0,"timestamp":"t"}"#),
        );

        assert_eq!(directive, FrameDirective::Data);
        assert_eq!(store.price(Asset::Btc).unwrap().price, 64000.0);
    }

    #[test]
    fn price_frame_extends_trailing_open_candle() {
        let store = SharedStateStore::new();
        store.set_candles(
            Asset::Btc,
            vec![Candle {
                timestamp: 0,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 2.0,
                is_closed: false,
            }],
        );

        handle_frame(
            Asset::Btc,
            &store,
            text_frame(r#"{"event":"price_update","asset":"BTC","price":103.0,"timestamp":"t"}"#),
        );

        let last = store.last_candle(Asset::Btc).unwrap();
        assert_eq!(last.close, 103.0);
        assert_eq!(last.high, 103.0);
        assert_eq!(last.open, 100.0);
    }

    #[test]
    fn signals_frame_replaces_signal_set_wholesale() {
        let store = SharedStateStore::new();
        let first = r#"{"event":"signals_update","asset":"BTC","contracts":[{"ticker":"a"},{"ticker":"b"}],"volatility":{"regime":"CALM"}}"#;
        let second = r#"{"event":"signals_update","asset":"BTC","contracts":[{"ticker":"c"}],"volatility":{"regime":"ELEVATED"}}"#;

        handle_frame(Asset::Btc, &store, text_frame(first));
        assert_eq!(store.signals(Asset::Btc).unwrap().contracts.len(), 2);

        handle_frame(Asset::Btc, &store, text_frame(second));
        assert_eq!(store.signals(Asset::Btc).unwrap().contracts.len(), 1);
    }

    #[test]
    fn ack_frame_counts_as_data_without_writing_state() {
        let store = SharedStateStore::new();
        let directive = handle_frame(
            Asset::Eth,
            &store,
            text_frame(r#"{"event":"connected","asset":"ETH"}"#),
        );

        assert_eq!(directive, FrameDirective::Data);
        assert!(store.price(Asset::Eth).is_none());
        assert!(store.signals(Asset::Eth).is_none());
    }

    #[test]
    fn frames_for_other_assets_are_ignored() {
        let store = SharedStateStore::new();
        let directive = handle_frame(
            Asset::Btc,
            &store,
            text_frame(r#"{"event":"price_update","asset":"ETH","price":3000.0,"timestamp":"t"}"#),
        );

        assert_eq!(directive, FrameDirective::Ignored);
        assert!(store.price(Asset::Btc).is_none());
        assert!(store.price(Asset::Eth).is_none());
    }

    #[test]
    fn undecodable_and_control_frames_are_ignored() {
        let store = SharedStateStore::new();
        assert_eq!(
            handle_frame(Asset::Btc, &store, text_frame("not json")),
            FrameDirective::Ignored
        );
        assert_eq!(
            handle_frame(Asset::Btc, &store, Message::Ping(Vec::new())),
            FrameDirective::Ignored
        );
        assert_eq!(
            handle_frame(Asset::Btc, &store, Message::Close(None)),
            FrameDirective::Closed
        );
    }
}
