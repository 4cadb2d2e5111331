use market_sync::{Asset, SharedStateStore, StreamManager, SyncConfig, SyncError};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::from_env()?;
    tracing::info!(
        rest = %config.rest_base_url,
        push = %config.push_base_url,
        "starting market sync core"
    );

    let store = Arc::new(SharedStateStore::new());
    let manager = StreamManager::new(config, Arc::clone(&store));
    manager.start();
    manager.connect_asset(Asset::Btc);

    let mut updates = store.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(update) => tracing::debug!(?update, "store update"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "store update feed lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    tracing::info!("shutting down");
    manager.stop().await;
    Ok(())
}
