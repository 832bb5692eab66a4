use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::timeframes::{parse_timeframes_csv, Timeframe};

pub const CLOB_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const DATA_API_URL: &str = "https://data-api.polymarket.com";
pub const DEFAULT_RPC_URLS: &[&str] = &["https://polygon.drpc.org", "https://polygon-rpc.com"];
pub const DEFAULT_RPC_WS_URL: &str = "wss://polygon-bor-rpc.publicnode.com";

/// CTF exchange. The only contract the strict backfill scans, and the fixed taker of
/// every fill it keeps.
pub const CTF_EXCHANGE: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";
pub const NEG_RISK_CTF_EXCHANGE: &str = "0xc5d563a36ae78145c45a50134d48a1215220f80a";
pub const EXCHANGE_ADDRESSES: &[&str] = &[CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE];

/// keccak256 of the exchange `OrderFilled` event.
pub const ORDER_FILLED_TOPIC0: &str =
    "0xd0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6";

/// Collateral (USDC) leg of every fill, and the fixed-point scale of all amounts.
pub const QUOTE_ASSET_ID: &str = "0";
pub const AMOUNT_DECIMALS: u32 = 6;

/// Gamma tag for bitcoin markets.
pub const BTC_TAG_ID: u32 = 235;
pub const GAMMA_PAGE_LIMIT: usize = 500;
pub const TRADE_PAGE_LIMIT: usize = 1000;
/// Data API rejects `offset + limit >= 4000`.
pub const TRADE_MAX_OFFSET: usize = 3000;
pub const REST_MIN_INTERVAL_MS: u64 = 300;
pub const REST_RETRY_DELAY_MS: u64 = 2000;

pub const RPC_BACKOFF_BASE_MS: u64 = 1200;
pub const RPC_BACKOFF_CAP_MS: u64 = 4000;

pub const DEFAULT_INITIAL_SPAN_BLOCKS: u64 = 100;
pub const DEFAULT_MIN_SPAN_BLOCKS: u64 = 1;
/// Pages at or above this size keep a shrunk span from growing back.
pub const SPAN_RECOVERY_MAX_LOGS: usize = 2000;
pub const SCAN_PROGRESS_EVERY_RANGES: usize = 20;

/// Transport reconnect backoff: `min(base * 2^n, cap)`.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 60_000;
/// Keepalive text frame interval on the CLOB feed.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const HEARTBEAT_FRAME: &str = "PING";

/// Bounded dedup windows on the real-time path.
pub const PROCESSED_BLOCK_LIMIT: usize = 4096;
pub const SEEN_LOG_UID_LIMIT: usize = 100_000;

/// Processor queue poll timeout, so it can observe shutdown.
pub const HEAD_QUEUE_POLL_MS: u64 = 1_000;
/// Bounded join on shutdown.
pub const SHUTDOWN_JOIN_SECS: u64 = 10;

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;
pub const BROADCAST_CAPACITY: usize = 4096;

/// Recorder discovery interval (seconds).
pub const RECORDER_POLL_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP JSON-RPC endpoints, rotated on failure (RPC_URLS, comma-separated).
    pub rpc_urls: Vec<String>,
    /// Head subscription endpoint (RPC_WS_URL).
    pub rpc_ws_url: String,
    pub clob_ws_url: String,
    pub gamma_api_url: String,
    pub data_api_url: String,
    pub output_dir: PathBuf,
    /// Optional SQLite trade sink (DB_PATH).
    pub db_path: Option<String>,
    pub timeframes: Vec<Timeframe>,
    pub market_poll_interval_secs: u64,
    pub grace_period_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub broadcast_addr: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_urls: Vec<String> = match std::env::var("RPC_URLS") {
            Ok(raw) => split_csv(&raw),
            Err(_) => DEFAULT_RPC_URLS.iter().map(|s| s.to_string()).collect(),
        };
        if rpc_urls.is_empty() {
            return Err(AppError::Config("RPC_URLS must list at least one endpoint".to_string()));
        }

        Ok(Self {
            rpc_urls: rpc_urls.iter().map(|u| normalize_rpc_http_url(u)).collect(),
            rpc_ws_url: std::env::var("RPC_WS_URL")
                .unwrap_or_else(|_| DEFAULT_RPC_WS_URL.to_string()),
            clob_ws_url: std::env::var("CLOB_WS_URL").unwrap_or_else(|_| CLOB_WS_URL.to_string()),
            gamma_api_url: std::env::var("GAMMA_API_URL")
                .unwrap_or_else(|_| GAMMA_API_URL.to_string()),
            data_api_url: std::env::var("DATA_API_URL")
                .unwrap_or_else(|_| DATA_API_URL.to_string()),
            output_dir: PathBuf::from(
                std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()),
            ),
            db_path: std::env::var("DB_PATH").ok().filter(|s| !s.trim().is_empty()),
            timeframes: parse_timeframes_csv(std::env::var("TIMEFRAMES").ok().as_deref())?,
            market_poll_interval_secs: env_parse("MARKET_POLL_INTERVAL_SECS", 300)?,
            grace_period_secs: env_parse("GRACE_PERIOD_SECS", 120)?,
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", 30)?,
            max_retries: env_parse("MAX_RETRIES", 5)?,
            broadcast_addr: std::env::var("BROADCAST_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8765".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} must be a valid number, got {raw:?}"))),
        _ => Ok(default),
    }
}

pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// JSON-RPC over HTTP needs an http(s) scheme even when the provider hands out ws(s) URLs.
pub fn normalize_rpc_http_url(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("wss://") {
        format!("https://{}", &url["wss://".len()..])
    } else if lower.starts_with("ws://") {
        format!("http://{}", &url["ws://".len()..])
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_urls_become_http() {
        assert_eq!(
            normalize_rpc_http_url("wss://polygon.example/v1/key"),
            "https://polygon.example/v1/key"
        );
        assert_eq!(normalize_rpc_http_url("ws://localhost:8546"), "http://localhost:8546");
        assert_eq!(
            normalize_rpc_http_url("https://polygon-rpc.com"),
            "https://polygon-rpc.com"
        );
    }

    #[test]
    fn split_csv_drops_blanks() {
        assert_eq!(split_csv(" a, ,b,"), vec!["a".to_string(), "b".to_string()]);
    }
}
