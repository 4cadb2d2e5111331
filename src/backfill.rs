use crate::asset::Asset;
use crate::backend::fetch_candle_history;
use crate::config::SyncConfig;
use crate::retry::request_with_retry;
use crate::store::SharedStateStore;
use crate::types::{Candle, ConnectionState};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct PollerHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

pub(crate) fn spawn_backfill_poller(
    config: Arc<SyncConfig>,
    store: Arc<SharedStateStore>,
    client: Client,
    selected_rx: watch::Receiver<Option<Asset>>,
) -> PollerHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_backfill_poller(
        config,
        store,
        client,
        selected_rx,
        cancel.clone(),
    ));
    PollerHandle { cancel, task }
}

/// Reconciles push-delivered candles with the authoritative REST history
/// for the currently selected asset. Wakes on the poll interval and on
/// selection changes; a selection change resets the watermark, forcing a
/// full resync (a freshly selected asset has no established high-water
/// mark).
async fn run_backfill_poller(
    config: Arc<SyncConfig>,
    store: Arc<SharedStateStore>,
    client: Client,
    mut selected_rx: watch::Receiver<Option<Asset>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut polled_asset: Option<Asset> = None;
    let mut watermark: Option<i64> = None;
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = selected_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        let Some(asset) = *selected_rx.borrow_and_update() else {
            continue;
        };

        if polled_asset != Some(asset) {
            polled_asset = Some(asset);
            watermark = None;
            consecutive_failures = 0;
        }

        let fetched = request_with_retry(&config.retry, || {
            fetch_candle_history(
                &client,
                &config.rest_base_url,
                asset,
                config.candle_interval,
                config.candle_limit,
            )
        })
        .await;

        match fetched {
            Ok(candles) => {
                consecutive_failures = 0;
                apply_backfill(&store, asset, candles, &mut watermark);
            }
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                warn!(%asset, consecutive_failures, %error, "candle backfill poll failed");
                if consecutive_failures >= config.backfill_failure_threshold {
                    store.set_connection_state(
                        asset,
                        ConnectionState::Error,
                        Some(format!("candle backfill failing: {error}")),
                    );
                }
            }
        }
    }

    debug!("backfill poller stopped");
}

/// Applies one poll result. Without a watermark the whole sequence is
/// replaced; with one, rows strictly above it are appended (advancing the
/// watermark) and the row equal to it refreshes the forming candle.
pub(crate) fn apply_backfill(
    store: &SharedStateStore,
    asset: Asset,
    candles: Vec<Candle>,
    watermark: &mut Option<i64>,
) {
    match *watermark {
        None => {
            *watermark = candles.last().map(|candle| candle.timestamp);
            store.set_candles(asset, candles);
        }
        Some(mark) => {
            let mut mark = mark;
            for candle in candles {
                if candle.timestamp > mark {
                    mark = candle.timestamp;
                    store.add_candle(asset, candle);
                } else if candle.timestamp == mark {
                    store.update_last_candle(asset, candle);
                }
            }
            *watermark = Some(mark);
        }
    }
}
