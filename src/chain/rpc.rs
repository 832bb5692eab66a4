use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::chain::decoder::{parse_quantity, to_quantity};
use crate::config::{RPC_BACKOFF_BASE_MS, RPC_BACKOFF_CAP_MS};
use crate::error::{AppError, Result};

/// Error strings worth another attempt on the next endpoint.
const RETRYABLE_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "too many requests",
    "rate limit",
    "429",
    "connection reset",
    "service unavailable",
    "gateway timeout",
    "internal error",
    "unauthorized",
    "forbidden",
    "api key",
];

pub fn is_retryable_rpc_error(message: &str) -> bool {
    let msg = message.to_lowercase();
    RETRYABLE_KEYWORDS.iter().any(|k| msg.contains(k))
}

/// `eth_getLogs` filter. Addresses and topics are lowercase hex.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(serialize_with = "one_or_many")]
    pub address: Vec<String>,
    pub from_block: String,
    pub to_block: String,
    pub topics: Vec<Option<String>>,
}

impl LogFilter {
    pub fn new(addresses: &[&str], from_block: u64, to_block: u64, topics: Vec<Option<String>>) -> Self {
        Self {
            address: addresses.iter().map(|a| a.to_ascii_lowercase()).collect(),
            from_block: to_quantity(from_block),
            to_block: to_quantity(to_block),
            topics: topics
                .into_iter()
                .map(|t| t.map(|t| t.to_ascii_lowercase()))
                .collect(),
        }
    }
}

fn one_or_many<S: Serializer>(addresses: &[String], s: S) -> std::result::Result<S::Ok, S::Error> {
    match addresses {
        [single] => s.serialize_str(single),
        many => many.serialize(s),
    }
}

/// The chain reads the scanner, resolver and block processor depend on.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn block_timestamp(&self, block_number: u64) -> Result<u64>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Value>>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

/// JSON-RPC over HTTP with endpoint rotation.
///
/// Transport failures and retryable JSON-RPC errors rotate to the next endpoint and back
/// off `min(base * attempt, cap)`. Any other JSON-RPC error fails immediately.
pub struct RpcClient {
    http: reqwest::Client,
    urls: Vec<String>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl RpcClient {
    pub fn new(urls: Vec<String>, timeout: Duration, max_retries: u32) -> Result<Self> {
        if urls.is_empty() {
            return Err(AppError::Config("at least one RPC url is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("polymarket-chain-trades/0.1")
            .build()?;
        Ok(Self {
            http,
            urls,
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            max_retries: max_retries.max(1),
            backoff_base: Duration::from_millis(RPC_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(RPC_BACKOFF_CAP_MS),
        })
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn current_url(&self) -> &str {
        &self.urls[self.cursor.load(Ordering::Relaxed) % self.urls.len()]
    }

    fn rotate(&self) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff_base * attempt).min(self.backoff_cap)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let url = self.current_url().to_string();
            let payload = json!({
                "jsonrpc": "2.0",
                "id": self.next_id.fetch_add(1, Ordering::Relaxed),
                "method": method,
                "params": params,
            });

            match self.post(&url, &payload).await {
                Err(e) => {
                    debug!(method, url = %url, attempt, "RPC transport error: {e}");
                    last_error = e.to_string();
                }
                Ok(RpcResponse { error: Some(err), .. }) => {
                    let message = err.to_string();
                    if !is_retryable_rpc_error(&message) {
                        return Err(AppError::Rpc { method: method.to_string(), message });
                    }
                    debug!(method, url = %url, attempt, "RPC retryable error: {message}");
                    last_error = message;
                }
                Ok(RpcResponse { result, .. }) => return Ok(result.unwrap_or(Value::Null)),
            }

            self.rotate();
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        warn!(method, attempts = self.max_retries, "RPC call exhausted retries: {last_error}");
        Err(AppError::RpcExhausted {
            method: method.to_string(),
            attempts: self.max_retries,
            last_error,
        })
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<RpcResponse> {
        let resp = self.http.post(url).json(payload).send().await?.error_for_status()?;
        Ok(resp.json::<RpcResponse>().await?)
    }
}

#[async_trait]
impl ChainRpc for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&v))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        let block = self
            .call("eth_getBlockByNumber", json!([to_quantity(block_number), false]))
            .await?;
        match block.get("timestamp") {
            Some(ts) => Ok(parse_quantity(ts)),
            None => Err(AppError::Rpc {
                method: "eth_getBlockByNumber".to_string(),
                message: format!("unexpected block payload for block={block_number}"),
            }),
        }
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Value>> {
        let v = self.call("eth_getLogs", json!([filter])).await?;
        match v {
            Value::Array(logs) => Ok(logs.into_iter().filter(Value::is_object).collect()),
            other => Err(AppError::Rpc {
                method: "eth_getLogs".to_string(),
                message: format!("unexpected eth_getLogs response: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    #[test]
    fn retryable_keywords() {
        assert!(is_retryable_rpc_error("{\"code\":429,\"message\":\"Too Many Requests\"}"));
        assert!(is_retryable_rpc_error("Gateway Timeout"));
        assert!(is_retryable_rpc_error("missing API key"));
        assert!(!is_retryable_rpc_error("execution reverted"));
        assert!(!is_retryable_rpc_error("block range is too large"));
    }

    #[test]
    fn filter_serializes_like_the_node_expects() {
        let f = LogFilter::new(
            &["0x4BFB41D5B3570DEFD03C39A9A4D8DE6BD8B8982E"],
            16,
            31,
            vec![Some("0xD0A0".to_string()), None, None, Some("0x00ab".to_string())],
        );
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["address"], "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e");
        assert_eq!(v["fromBlock"], "0x10");
        assert_eq!(v["toBlock"], "0x1f");
        assert_eq!(v["topics"], json!(["0xd0a0", null, null, "0x00ab"]));

        let f = LogFilter::new(&["0xa", "0xb"], 1, 1, vec![Some("0x1".to_string())]);
        assert_eq!(serde_json::to_value(&f).unwrap()["address"], json!(["0xa", "0xb"]));
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let c = RpcClient::new(vec!["http://localhost:1".into()], Duration::from_secs(1), 4)
            .unwrap();
        assert_eq!(c.backoff(1), Duration::from_millis(1200));
        assert_eq!(c.backoff(2), Duration::from_millis(2400));
        assert_eq!(c.backoff(3), Duration::from_millis(3600));
        assert_eq!(c.backoff(4), Duration::from_millis(4000));
    }

    async fn serve(handler: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, handler).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn rotates_past_a_dead_endpoint() {
        let live = serve(Router::new().route(
            "/",
            post(|| async { Json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x2a"})) }),
        ))
        .await;
        let client = RpcClient::new(vec![dead_url().await, live.clone()], Duration::from_secs(2), 3)
            .unwrap()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));

        assert_eq!(client.block_number().await.unwrap(), 42);
        assert_eq!(client.current_url(), live);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let url = serve(Router::new().route(
            "/",
            post(|| async {
                Json(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "invalid params"}}))
            }),
        ))
        .await;
        let client = RpcClient::new(vec![url], Duration::from_secs(2), 3)
            .unwrap()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));

        match client.call("eth_getLogs", json!([])).await {
            Err(AppError::Rpc { method, message }) => {
                assert_eq!(method, "eth_getLogs");
                assert!(message.contains("invalid params"));
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retryable_error_exhausts_attempts() {
        let url = serve(Router::new().route(
            "/",
            post(|| async {
                Json(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "query timeout exceeded"}}))
            }),
        ))
        .await;
        let client = RpcClient::new(vec![url], Duration::from_secs(2), 2)
            .unwrap()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));

        let err = client.call("eth_getLogs", json!([])).await.unwrap_err();
        assert!(matches!(err, AppError::RpcExhausted { attempts: 2, .. }));
        assert!(err.is_span_too_wide());
    }
}
