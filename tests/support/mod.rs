#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use market_sync::SyncSettings;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct PushServerState {
    current: AtomicUsize,
    peak: AtomicUsize,
    accepts: StdMutex<HashMap<String, usize>>,
    silent: AtomicBool,
}

impl PushServerState {
    fn record_accept(&self, segment: &str) {
        let mut accepts = self.accepts.lock().unwrap();
        *accepts.entry(segment.to_string()).or_insert(0) += 1;
    }
}

struct ConnGuard {
    state: Arc<PushServerState>,
}

impl ConnGuard {
    fn new(state: Arc<PushServerState>) -> Self {
        let current = state.current.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(current, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process push-channel server: accepts websocket connections on
/// `/stream/{asset}`, acknowledges them, and streams synthetic price and
/// signal frames. Tracks per-asset accept counts and the peak number of
/// simultaneous connections.
pub struct MockPushServer {
    addr: SocketAddr,
    state: Arc<PushServerState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockPushServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind mock push server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(PushServerState::default());
        let cancel = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let conn_state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            handle_push_connection(conn_state, stream).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            state,
            cancel,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn peak_connections(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn current_connections(&self) -> usize {
        self.state.current.load(Ordering::SeqCst)
    }

    pub fn accepts(&self, segment: &str) -> usize {
        self.state
            .accepts
            .lock()
            .unwrap()
            .get(segment)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for MockPushServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn handle_push_connection(state: Arc<PushServerState>, stream: TcpStream) {
    let captured_path = Arc::new(StdMutex::new(String::new()));
    let path_clone = Arc::clone(&captured_path);
    let websocket = match accept_hdr_async(stream, move |req: &Request, resp: WsResponse| {
        *path_clone.lock().unwrap() = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    {
        Ok(websocket) => websocket,
        Err(_) => return,
    };

    let path = captured_path.lock().unwrap().clone();
    let segment = path.rsplit('/').next().unwrap_or_default().to_string();
    let symbol = segment.to_ascii_uppercase();
    state.record_accept(&segment);
    let _guard = ConnGuard::new(Arc::clone(&state));

    let (mut sink, mut source) = websocket.split();

    if state.silent.load(Ordering::SeqCst) {
        // Hold the socket open without ever sending a frame.
        while let Some(message) = source.next().await {
            if matches!(message, Err(_) | Ok(Message::Close(_))) {
                break;
            }
        }
        return;
    }

    let ack = serde_json::json!({ "event": "connected", "asset": symbol });
    if sink.send(Message::Text(ack.to_string())).await.is_err() {
        return;
    }

    let mut price = 100.0_f64;
    let mut frames_sent = 0_u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    loop {
        tokio::select! {
            incoming = source.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                price += 0.5;
                frames_sent += 1;
                let frame = if frames_sent % 5 == 0 {
                    serde_json::json!({
                        "event": "signals_update",
                        "asset": symbol,
                        "contracts": [{ "ticker": format!("{symbol}-HOURLY"), "signalType": "BUY YES" }],
                        "volatility": { "regime": "NORMAL", "dvol": 48.5 },
                    })
                } else {
                    serde_json::json!({
                        "event": "price_update",
                        "asset": symbol,
                        "price": price,
                        "timestamp": "2025-06-01T12:00:00Z",
                    })
                };
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[derive(Default)]
pub struct RestApiState {
    rows: StdMutex<HashMap<String, Vec<serde_json::Value>>>,
    fail: AtomicBool,
    hits: AtomicUsize,
}

/// In-process candle REST server answering
/// `GET /api/v1/candles/{ASSET}?interval=..&limit=..`.
pub struct MockRestApi {
    addr: SocketAddr,
    state: Arc<RestApiState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockRestApi {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind mock REST server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(RestApiState::default());
        let cancel = CancellationToken::new();

        let router = Router::new()
            .route("/api/v1/candles/:asset", get(candles_handler))
            .with_state(Arc::clone(&state));
        let shutdown = cancel.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await;
        });

        Self {
            addr,
            state,
            cancel,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_rows(&self, symbol: &str, rows: Vec<serde_json::Value>) {
        self.state
            .rows
            .lock()
            .unwrap()
            .insert(symbol.to_string(), rows);
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockRestApi {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn candles_handler(
    State(state): State<Arc<RestApiState>>,
    Path(asset): Path<String>,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.fail.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let rows = state
        .rows
        .lock()
        .unwrap()
        .get(&asset)
        .cloned()
        .unwrap_or_default();
    Json(rows).into_response()
}

/// `[timestamp_ms, open, high, low, close, volume]` row as the candle
/// endpoint serves it.
pub fn candle_row(timestamp: i64, close: f64) -> serde_json::Value {
    serde_json::json!([timestamp, close, close + 1.0, close - 1.0, close, 10.0])
}

/// Settings tuned for fast, deterministic integration tests.
pub fn test_settings(push: &MockPushServer, rest: &MockRestApi) -> SyncSettings {
    SyncSettings {
        rest_base_url: Some(rest.base_url()),
        push_base_url: Some(push.base_url()),
        poll_interval_ms: Some(250),
        idle_grace_ms: Some(400),
        connect_timeout_ms: Some(300),
        backoff_initial_ms: Some(50),
        backoff_max_ms: Some(200),
        candle_limit: Some(50),
        backfill_failure_threshold: Some(2),
        retry_max: Some(1),
        retry_initial_ms: Some(20),
        retry_max_delay_ms: Some(40),
        retry_timeout_ms: Some(1_000),
        ..Default::default()
    }
}

/// Polls `predicate` every 10 ms until it holds or `timeout_ms` elapses.
pub async fn wait_until<F>(timeout_ms: u64, predicate: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
