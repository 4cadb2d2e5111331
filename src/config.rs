use crate::error::SyncError;
use crate::retry::RetryOptions;
use crate::types::CandleInterval;
use std::env;
use std::time::Duration;

pub const DEFAULT_REST_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PUSH_BASE_URL: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_IDLE_GRACE_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_CANDLE_INTERVAL: CandleInterval = CandleInterval::M1;
pub const DEFAULT_CANDLE_LIMIT: u16 = 500;
pub const DEFAULT_BACKFILL_FAILURE_THRESHOLD: u32 = 5;
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
pub const MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const MIN_IDLE_GRACE_MS: u64 = 100;
pub const MAX_IDLE_GRACE_MS: u64 = 600_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 100;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 120_000;
pub const MIN_CANDLE_LIMIT: u16 = 10;
pub const MAX_CANDLE_LIMIT: u16 = 5_000;

/// Raw, partially specified settings; every `None` falls back to the
/// documented default during [`SyncSettings::normalize`].
#[derive(Debug, Clone, Default)]
pub struct SyncSettings {
    pub rest_base_url: Option<String>,
    pub push_base_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub idle_grace_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub candle_interval: Option<String>,
    pub candle_limit: Option<u16>,
    pub backfill_failure_threshold: Option<u32>,
    pub retry_max: Option<u32>,
    pub retry_initial_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub rest_base_url: String,
    pub push_base_url: String,
    pub poll_interval: Duration,
    pub idle_grace: Duration,
    pub connection_timeout: Duration,
    pub backoff_initial_delay: Duration,
    pub backoff_max_delay: Duration,
    pub candle_interval: CandleInterval,
    pub candle_limit: u16,
    pub backfill_failure_threshold: u32,
    pub retry: RetryOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncSettings::default()
            .normalize()
            .unwrap_or_else(|_| unreachable!("default settings are always valid"))
    }
}

impl SyncSettings {
    pub fn from_env() -> Self {
        Self {
            rest_base_url: env_str("MARKET_SYNC_REST_URL"),
            push_base_url: env_str("MARKET_SYNC_PUSH_URL"),
            poll_interval_ms: env_u64("MARKET_SYNC_POLL_INTERVAL_MS"),
            idle_grace_ms: env_u64("MARKET_SYNC_IDLE_GRACE_MS"),
            connect_timeout_ms: env_u64("MARKET_SYNC_CONNECT_TIMEOUT_MS"),
            backoff_initial_ms: env_u64("MARKET_SYNC_BACKOFF_INITIAL_MS"),
            backoff_max_ms: env_u64("MARKET_SYNC_BACKOFF_MAX_MS"),
            candle_interval: env_str("MARKET_SYNC_CANDLE_INTERVAL"),
            candle_limit: env_u16("MARKET_SYNC_CANDLE_LIMIT"),
            backfill_failure_threshold: env_u32("MARKET_SYNC_BACKFILL_FAILURE_THRESHOLD"),
            retry_max: env_u32("MARKET_SYNC_RETRY_MAX"),
            retry_initial_ms: env_u64("MARKET_SYNC_RETRY_INITIAL_MS"),
            retry_max_delay_ms: env_u64("MARKET_SYNC_RETRY_MAX_DELAY_MS"),
            retry_timeout_ms: env_u64("MARKET_SYNC_RETRY_TIMEOUT_MS"),
        }
    }

    pub fn normalize(self) -> Result<SyncConfig, SyncError> {
        let rest_base_url = normalize_base_url(
            self.rest_base_url
                .unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string()),
            &["http://", "https://"],
        )?;
        let push_base_url = normalize_base_url(
            self.push_base_url
                .unwrap_or_else(|| DEFAULT_PUSH_BASE_URL.to_string()),
            &["ws://", "wss://"],
        )?;

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(SyncError::InvalidConfig(format!(
                "poll interval must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS} ms"
            )));
        }

        let idle_grace_ms = self.idle_grace_ms.unwrap_or(DEFAULT_IDLE_GRACE_MS);
        if !(MIN_IDLE_GRACE_MS..=MAX_IDLE_GRACE_MS).contains(&idle_grace_ms) {
            return Err(SyncError::InvalidConfig(format!(
                "idle grace must be between {MIN_IDLE_GRACE_MS} and {MAX_IDLE_GRACE_MS} ms"
            )));
        }

        let connect_timeout_ms = self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(SyncError::InvalidConfig(format!(
                "connection timeout must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS} ms"
            )));
        }

        let backoff_initial_ms = self.backoff_initial_ms.unwrap_or(DEFAULT_BACKOFF_INITIAL_MS);
        let backoff_max_ms = self.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS);
        if backoff_initial_ms == 0 || backoff_max_ms < backoff_initial_ms {
            return Err(SyncError::InvalidConfig(
                "backoff delays must be positive and max >= initial".to_string(),
            ));
        }

        let candle_interval = match self.candle_interval {
            Some(raw) => raw.parse()?,
            None => DEFAULT_CANDLE_INTERVAL,
        };

        let candle_limit = self.candle_limit.unwrap_or(DEFAULT_CANDLE_LIMIT);
        if !(MIN_CANDLE_LIMIT..=MAX_CANDLE_LIMIT).contains(&candle_limit) {
            return Err(SyncError::InvalidConfig(format!(
                "candle limit must be between {MIN_CANDLE_LIMIT} and {MAX_CANDLE_LIMIT}"
            )));
        }

        let backfill_failure_threshold = self
            .backfill_failure_threshold
            .unwrap_or(DEFAULT_BACKFILL_FAILURE_THRESHOLD);
        if backfill_failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "backfill failure threshold must be positive".to_string(),
            ));
        }

        let defaults = RetryOptions::default();
        let retry = RetryOptions {
            max_retries: self.retry_max.unwrap_or(defaults.max_retries),
            initial_delay: self
                .retry_initial_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .retry_max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            per_attempt_timeout: self
                .retry_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.per_attempt_timeout),
        };
        if retry.initial_delay.is_zero() || retry.max_delay < retry.initial_delay {
            return Err(SyncError::InvalidConfig(
                "retry delays must be positive and max >= initial".to_string(),
            ));
        }
        if retry.per_attempt_timeout.is_zero() {
            return Err(SyncError::InvalidConfig(
                "per-attempt timeout must be positive".to_string(),
            ));
        }

        Ok(SyncConfig {
            rest_base_url,
            push_base_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            idle_grace: Duration::from_millis(idle_grace_ms),
            connection_timeout: Duration::from_millis(connect_timeout_ms),
            backoff_initial_delay: Duration::from_millis(backoff_initial_ms),
            backoff_max_delay: Duration::from_millis(backoff_max_ms),
            candle_interval,
            candle_limit,
            backfill_failure_threshold,
            retry,
        })
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        SyncSettings::from_env().normalize()
    }
}

fn normalize_base_url(raw: String, schemes: &[&str]) -> Result<String, SyncError> {
    let trimmed = raw.trim().trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidConfig("base url must be non-empty".to_string()));
    }
    if !schemes.iter().any(|scheme| trimmed.starts_with(scheme)) {
        return Err(SyncError::InvalidConfig(format!(
            "base url '{trimmed}' must start with one of {schemes:?}"
        )));
    }
    Ok(trimmed)
}

fn env_str(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
