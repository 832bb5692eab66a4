use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Config, BTC_TAG_ID, GAMMA_PAGE_LIMIT, REST_MIN_INTERVAL_MS, REST_RETRY_DELAY_MS};
use crate::error::{AppError, Result};
use crate::rate_limit::RateLimiter;
use crate::state::tracker::MarketSource;
use crate::timeframes::{parse_market_slug, Timeframe};
use crate::types::Market;

/// Gamma metadata and Data API history over one rate-limited HTTP client.
pub struct RestClient {
    http: reqwest::Client,
    gamma_url: String,
    data_url: String,
    limiter: RateLimiter,
    max_retries: u32,
    retry_delay: Duration,
}

impl RestClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_urls(
            &cfg.gamma_api_url,
            &cfg.data_api_url,
            Duration::from_secs(cfg.request_timeout_secs),
            cfg.max_retries,
        )
    }

    pub fn with_urls(gamma_url: &str, data_url: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("polymarket-chain-trades/0.1")
            .build()?;
        Ok(Self {
            http,
            gamma_url: gamma_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(Duration::from_millis(REST_MIN_INTERVAL_MS)),
            max_retries: max_retries.max(1),
            retry_delay: Duration::from_millis(REST_RETRY_DELAY_MS),
        })
    }

    #[cfg(test)]
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn get_gamma(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.get_json(&format!("{}{path}", self.gamma_url), query).await
    }

    pub async fn get_data(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.get_json(&format!("{}{path}", self.data_url), query).await
    }

    /// GET with retry on transport errors, 429 and 5xx. Waits `delay * attempt`,
    /// doubled for 429. Other 4xx statuses fail at once.
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let (err, throttled) = match self.http.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await?;
                        return Ok(serde_json::from_str(&text)?);
                    }
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    let err = match resp.error_for_status() {
                        Err(e) => AppError::Http(e),
                        Ok(_) => AppError::Bootstrap(format!("unexpected status {status} from {url}")),
                    };
                    if !retryable {
                        return Err(err);
                    }
                    (err, status == StatusCode::TOO_MANY_REQUESTS)
                }
                Err(e) => (AppError::Http(e), false),
            };

            if attempt >= self.max_retries {
                warn!(url, attempts = attempt, "REST request exhausted retries: {err}");
                return Err(err);
            }
            let mut delay = self.retry_delay * attempt;
            if throttled {
                delay *= 2;
            }
            debug!(url, attempt, delay_ms = delay.as_millis() as u64, "REST retry: {err}");
            tokio::time::sleep(delay).await;
        }
    }

    /// One page of open BTC markets, newest id first.
    pub async fn fetch_open_markets_page(&self, offset: usize) -> Result<Vec<Value>> {
        let query = [
            ("tag_id", BTC_TAG_ID.to_string()),
            ("closed", "false".to_string()),
            ("active", "true".to_string()),
            ("limit", GAMMA_PAGE_LIMIT.to_string()),
            ("offset", offset.to_string()),
            ("order", "id".to_string()),
            ("ascending", "false".to_string()),
        ];
        match self.get_gamma("/markets", &query).await? {
            Value::Array(items) => Ok(items),
            _ => Err(AppError::Bootstrap(
                "GAMMA /markets response was not an array".to_string(),
            )),
        }
    }

    /// Raw Gamma market object for `slug`, with the fields a backfill needs.
    pub async fn fetch_market_by_slug(&self, slug: &str) -> Result<Value> {
        let resp = self.get_gamma("/markets", &[("slug", slug.to_string())]).await?;
        let market = resp
            .as_array()
            .and_then(|items| items.first())
            .cloned()
            .ok_or_else(|| AppError::Bootstrap(format!("Market not found: {slug}")))?;
        if !market.is_object() {
            return Err(AppError::Bootstrap(format!("Unexpected market payload for {slug}")));
        }
        for required in ["slug", "conditionId", "clobTokenIds", "outcomes"] {
            if market.get(required).is_none() {
                return Err(AppError::Bootstrap(format!("Missing market field '{required}'")));
            }
        }
        Ok(market)
    }
}

#[async_trait]
impl MarketSource for RestClient {
    async fn open_markets_page(&self, offset: usize) -> Result<Vec<Value>> {
        self.fetch_open_markets_page(offset).await
    }
}

/// Builds a `Market` from a Gamma object already matched to `timeframe`.
pub fn parse_gamma_market(raw: &Value, timeframe: Timeframe, window_start_ts: u64) -> Result<Market> {
    let slug = str_field(raw, "slug");
    let condition_id = str_field(raw, "conditionId");
    let token_ids = parse_json_list(raw.get("clobTokenIds"));
    let outcomes = parse_json_list(raw.get("outcomes"));
    if token_ids.is_empty() || condition_id.is_empty() {
        return Err(AppError::Bootstrap(format!(
            "market {slug} is missing token ids or condition id"
        )));
    }

    let event_id = raw
        .get("events")
        .and_then(|e| e.as_array())
        .and_then(|events| events.iter().find(|e| e.is_object()))
        .and_then(|e| e.get("id"))
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    let end_date_utc = str_field(raw, "endDate");
    let end_date_ts = parse_iso_to_unix_secs(&end_date_utc).unwrap_or(0);

    Market::new(
        slug,
        timeframe,
        event_id,
        window_start_ts,
        condition_id,
        token_ids,
        outcomes,
        end_date_utc,
        end_date_ts,
    )
}

/// `Market` for a slug resolved outside discovery (backfill, history).
pub fn market_from_slug_payload(raw: &Value) -> Result<Market> {
    let slug = str_field(raw, "slug");
    let (timeframe, window_start_ts) = parse_market_slug(&slug.to_ascii_lowercase())
        .ok_or_else(|| AppError::Bootstrap(format!("{slug} is not a BTC up/down market slug")))?;
    parse_gamma_market(raw, timeframe, window_start_ts)
}

/// Gamma encodes list fields as JSON text (`"[\"1\",\"2\"]"`) or, on some endpoints, as
/// plain arrays. A bare scalar string is a one-element list.
pub fn parse_json_list(value: Option<&Value>) -> Vec<String> {
    fn item(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    match value {
        Some(Value::Array(items)) => items.iter().map(item).collect(),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.starts_with('[') && s.ends_with(']') {
                match serde_json::from_str::<Vec<Value>>(s) {
                    Ok(items) => items.iter().map(item).collect(),
                    Err(_) => Vec::new(),
                }
            } else if s.is_empty() {
                Vec::new()
            } else {
                vec![s.to_string()]
            }
        }
        _ => Vec::new(),
    }
}

/// ISO-8601 (`Z`, offset, or naive UTC) or a bare date, to unix seconds.
pub fn parse_iso_to_unix_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return u64::try_from(dt.timestamp()).ok();
    }
    let spaced = s.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&spaced) {
        return u64::try_from(dt.timestamp()).ok();
    }
    if let Ok(dt) = DateTime::parse_from_str(&spaced, "%Y-%m-%dT%H:%M:%S%.f%#z") {
        return u64::try_from(dt.timestamp()).ok();
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&spaced, "%Y-%m-%dT%H:%M:%S%.f") {
        return u64::try_from(naive.and_utc().timestamp()).ok();
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    u64::try_from(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp()).ok()
}

/// Numeric or ISO timestamp field; 0 when absent or unparseable.
pub fn unix_field(raw: &Value, key: &str) -> u64 {
    match raw.get(key) {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)).unwrap_or(0),
        Some(Value::String(s)) => parse_iso_to_unix_secs(s).unwrap_or(0),
        _ => 0,
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode as AxumStatus, routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn gamma_market() -> Value {
        json!({
            "slug": "btc-updown-5m-1771211700",
            "conditionId": "0xcond",
            "clobTokenIds": "[\"77\", \"78\"]",
            "outcomes": "[\"Up\", \"Down\"]",
            "endDate": "2026-02-16T03:20:00Z",
            "events": [{"id": 9001, "seriesSlug": "btc-up-or-down-5m"}],
        })
    }

    #[test]
    fn builds_market_from_gamma_object() {
        let m = market_from_slug_payload(&gamma_market()).unwrap();
        assert_eq!(m.timeframe, Timeframe::M5);
        assert_eq!(m.window_start_ts, 1771211700);
        assert_eq!(m.event_id, "9001");
        assert_eq!(m.end_date_ts, 1771212000);
        assert_eq!(m.outcome_for("78"), Some("Down"));
    }

    #[test]
    fn missing_tokens_is_bootstrap_error() {
        let mut raw = gamma_market();
        raw["clobTokenIds"] = json!("");
        assert!(matches!(
            parse_gamma_market(&raw, Timeframe::M5, 1),
            Err(AppError::Bootstrap(_))
        ));
    }

    #[test]
    fn json_lists_in_both_encodings() {
        assert_eq!(parse_json_list(Some(&json!("[\"1\",\"2\"]"))), vec!["1", "2"]);
        assert_eq!(parse_json_list(Some(&json!(["1", 2]))), vec!["1", "2"]);
        assert_eq!(parse_json_list(Some(&json!("solo"))), vec!["solo"]);
        assert!(parse_json_list(None).is_empty());
    }

    #[test]
    fn iso_timestamps() {
        assert_eq!(parse_iso_to_unix_secs("2026-02-16T03:20:00Z"), Some(1771212000));
        assert_eq!(parse_iso_to_unix_secs("2026-02-16T03:20:00.123456Z"), Some(1771212000));
        assert_eq!(parse_iso_to_unix_secs("2026-02-16T04:20:00+01:00"), Some(1771212000));
        assert_eq!(parse_iso_to_unix_secs("2026-02-16 03:20:00+00"), Some(1771212000));
        assert_eq!(parse_iso_to_unix_secs("2026-02-16T03:20:00"), Some(1771212000));
        assert_eq!(parse_iso_to_unix_secs("2026-02-16"), Some(1771200000));
        assert_eq!(parse_iso_to_unix_secs("soon"), None);
        assert_eq!(unix_field(&json!({"t": 5}), "t"), 5);
        assert_eq!(unix_field(&json!({}), "t"), 0);
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(url: &str, max_retries: u32) -> RestClient {
        RestClient::with_urls(url, url, Duration::from_secs(2), max_retries)
            .unwrap()
            .with_limiter(RateLimiter::new(Duration::ZERO))
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_through_throttling() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/markets",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AxumStatus::TOO_MANY_REQUESTS)
                    } else {
                        Ok(Json(json!([gamma_market()])))
                    }
                }),
            )
            .with_state(hits.clone());
        let url = serve(router).await;

        let page = client(&url, 4).fetch_open_markets_page(0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/markets",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NOT_FOUND
                }),
            )
            .with_state(hits.clone());
        let url = serve(router).await;

        assert!(client(&url, 4).fetch_market_by_slug("x").await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_slug_is_reported() {
        let url = serve(Router::new().route("/markets", get(|| async { Json(json!([])) }))).await;
        match client(&url, 1).fetch_market_by_slug("gone").await {
            Err(AppError::Bootstrap(msg)) => assert!(msg.contains("gone")),
            other => panic!("expected Bootstrap, got {other:?}"),
        }
    }
}
