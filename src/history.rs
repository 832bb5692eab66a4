use std::collections::HashSet;
use std::path::{Path, PathBuf};

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{TRADE_MAX_OFFSET, TRADE_PAGE_LIMIT};
use crate::db::{TradeDb, TradeSource};
use crate::error::{AppError, Result};
use crate::fetcher::{market_from_slug_payload, RestClient};
use crate::normalize::rest_trade;
use crate::sink::write_rows;
use crate::types::{Market, Side, Trade};

/// Raw records for one query plus whether the listing was exhausted before the offset cap.
struct Paged {
    records: Vec<Value>,
    complete: bool,
}

async fn fetch_paged(client: &RestClient, condition_id: &str, side: Option<Side>) -> Result<Paged> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    loop {
        let mut query = vec![
            ("market", condition_id.to_string()),
            ("limit", TRADE_PAGE_LIMIT.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(side) = side {
            query.push(("side", side.as_str().to_string()));
        }

        let page = match client.get_data("/trades", &query).await {
            Ok(Value::Array(items)) => items,
            Ok(_) => {
                return Err(AppError::Bootstrap("Data API /trades response was not an array".to_string()))
            }
            // The provider answers 400 once offset + limit crosses its cap.
            Err(AppError::Http(e)) if offset > 0 && e.status() == Some(StatusCode::BAD_REQUEST) => {
                return Ok(Paged { records, complete: false });
            }
            Err(e) => return Err(e),
        };

        let n = page.len();
        records.extend(page);
        if n < TRADE_PAGE_LIMIT {
            return Ok(Paged { records, complete: true });
        }
        offset += TRADE_PAGE_LIMIT;
        if offset > TRADE_MAX_OFFSET {
            return Ok(Paged { records, complete: false });
        }
    }
}

/// Full REST history for a condition id, normalized and de-duplicated on `dedupe_key`.
///
/// When the unfiltered listing hits the offset cap it is re-queried per side, which roughly
/// doubles how far back the Data API will page.
pub async fn fetch_trade_history(client: &RestClient, market: &Market) -> Result<Vec<Trade>> {
    let first = fetch_paged(client, &market.condition_id, None).await?;
    let mut raw = first.records;

    if !first.complete {
        warn!(
            market = %market.slug,
            records = raw.len(),
            "Trade history hit the offset cap; splitting by side"
        );
        for side in [Side::Buy, Side::Sell] {
            let split = fetch_paged(client, &market.condition_id, Some(side)).await?;
            if !split.complete {
                warn!(market = %market.slug, %side, "Per-side history still truncated");
            }
            raw.extend(split.records);
        }
    }

    let mut seen = HashSet::new();
    let mut trades: Vec<Trade> = raw
        .iter()
        .filter_map(|r| rest_trade(r, market))
        .filter(|t| seen.insert(t.dedupe_key.clone()))
        .collect();
    trades.sort_by(|a, b| {
        a.trade_timestamp
            .cmp(&b.trade_timestamp)
            .then_with(|| a.transaction_hash.cmp(&b.transaction_hash))
    });
    Ok(trades)
}

pub fn history_csv_path(output_dir: &Path, slug: &str) -> PathBuf {
    output_dir.join("history").join(format!("trades_{slug}.csv"))
}

/// `history --slug`: resolve the market, pull its REST history, write the CSV and
/// optionally store it.
pub async fn run_history(
    client: &RestClient,
    slug: &str,
    output_dir: &Path,
    db: Option<&TradeDb>,
) -> Result<PathBuf> {
    let raw = client.fetch_market_by_slug(slug).await?;
    let market = market_from_slug_payload(&raw)?;
    info!(market = %market.slug, condition_id = %market.condition_id, "Fetching trade history");

    let trades = fetch_trade_history(client, &market).await?;
    let path = history_csv_path(output_dir, &market.slug);
    write_rows(&path, &trades)?;
    info!(market = %market.slug, trades = trades.len(), path = %path.display(), "History written");

    if let Some(db) = db {
        let inserted = db.insert_trades(&trades, TradeSource::Rest).await?;
        info!(market = %market.slug, inserted, "History stored");
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiter;
    use axum::{extract::Query, http::StatusCode as AxumStatus, routing::get, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

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

    fn record(i: usize, side: &str) -> Value {
        json!({
            "timestamp": 1771211700 + i as u64,
            "size": 2.0,
            "price": 0.25,
            "side": side,
            "outcome": "Up",
            "asset": "77",
            "proxyWallet": "0xw",
            "transactionHash": format!("0x{i:04x}{side}"),
        })
    }

    /// Data API stand-in: `total` records, at most 1000 per page, 400 past offset 3000.
    async fn trades(
        Query(q): Query<HashMap<String, String>>,
        total: usize,
    ) -> std::result::Result<Json<Value>, AxumStatus> {
        let offset: usize = q.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
        if offset > 3000 {
            return Err(AxumStatus::BAD_REQUEST);
        }
        let side = q.get("side").cloned();
        let count = match side.as_deref() {
            Some(_) => total / 2,
            None => total,
        };
        let end = count.min(offset + 1000);
        let page: Vec<Value> = (offset..end)
            .map(|i| match side.as_deref() {
                Some(s) => record(i, s),
                None => record(i, if i % 2 == 0 { "BUY" } else { "SELL" }),
            })
            .collect();
        Ok(Json(Value::Array(page)))
    }

    async fn serve(total: usize) -> String {
        let router = Router::new()
            .route("/markets", get(|| async { Json(json!([gamma_market()])) }))
            .route("/trades", get(move |q: Query<HashMap<String, String>>| trades(q, total)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(url: &str) -> RestClient {
        RestClient::with_urls(url, url, Duration::from_secs(2), 1)
            .unwrap()
            .with_limiter(RateLimiter::new(Duration::ZERO))
    }

    #[tokio::test]
    async fn pages_until_short_page() {
        let url = serve(1500).await;
        let market = market_from_slug_payload(&gamma_market()).unwrap();
        let trades = fetch_trade_history(&client(&url), &market).await.unwrap();
        assert_eq!(trades.len(), 1500);
        assert!(trades.windows(2).all(|w| w[0].trade_timestamp <= w[1].trade_timestamp));
        let t = &trades[0];
        assert_eq!(t.notional, Some(0.5));
        assert_eq!(t.market_slug, "btc-updown-5m-1771211700");
    }

    #[tokio::test]
    async fn capped_listing_is_split_by_side() {
        let url = serve(6000).await;
        let market = market_from_slug_payload(&gamma_market()).unwrap();
        let trades = fetch_trade_history(&client(&url), &market).await.unwrap();
        // 4000 unfiltered, plus 3000 per side with distinct hashes; overlaps collapse.
        let keys: HashSet<_> = trades.iter().map(|t| t.dedupe_key.clone()).collect();
        assert_eq!(keys.len(), trades.len());
        assert!(trades.len() > 4000);
        assert!(trades.iter().any(|t| t.side == Side::Sell));
    }

    #[tokio::test]
    async fn run_history_writes_csv() {
        let url = serve(3).await;
        let dir = tempfile::tempdir().unwrap();
        let path = run_history(&client(&url), "btc-updown-5m-1771211700", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("history/trades_btc-updown-5m-1771211700.csv"));
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.starts_with("market_slug,window_start_ts"));
    }
}
