use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::GAMMA_PAGE_LIMIT;
use crate::error::Result;
use crate::fetcher::parse_gamma_market;
use crate::timeframes::{match_updown_market, Timeframe};
use crate::types::Market;

/// Paginated listing of open markets.
#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn open_markets_page(&self, offset: usize) -> Result<Vec<Value>>;
}

#[derive(Default)]
struct TrackerState {
    /// slug -> market
    active: HashMap<String, Arc<Market>>,
    /// token_id -> slug
    token_index: HashMap<String, String>,
}

/// Active-market set and token index. Every read and write goes through one lock.
pub struct MarketTracker {
    source: Arc<dyn MarketSource>,
    timeframes: Vec<Timeframe>,
    grace_period_secs: u64,
    state: Mutex<TrackerState>,
}

impl MarketTracker {
    pub fn new(source: Arc<dyn MarketSource>, timeframes: Vec<Timeframe>, grace_period_secs: u64) -> Self {
        Self {
            source,
            timeframes,
            grace_period_secs,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Returns `(newly_added, newly_expired)`.
    pub async fn poll_once(&self) -> (Vec<Arc<Market>>, Vec<Arc<Market>>) {
        self.poll_once_at(now_secs()).await
    }

    pub async fn poll_once_at(&self, now_secs: u64) -> (Vec<Arc<Market>>, Vec<Arc<Market>>) {
        let candidates = self.fetch_candidates().await;
        let added = self.ingest(&candidates, now_secs);
        let expired = self.expire(now_secs);
        (added, expired)
    }

    /// Pages until a short or empty page. A page error ends the listing early.
    async fn fetch_candidates(&self) -> Vec<Value> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = match self.source.open_markets_page(offset).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, "Gamma market listing failed: {e}");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            out.extend(
                page.into_iter()
                    .filter(|m| match_updown_market(m, &self.timeframes).is_some()),
            );
            if page_len < GAMMA_PAGE_LIMIT {
                break;
            }
            offset += page_len;
        }
        out
    }

    /// Adds matching candidates not yet tracked and not already past expiry.
    pub fn ingest(&self, candidates: &[Value], now_secs: u64) -> Vec<Arc<Market>> {
        let mut added = Vec::new();
        let mut state = self.state.lock();
        for raw in candidates {
            let slug = raw.get("slug").and_then(|s| s.as_str()).unwrap_or("");
            if state.active.contains_key(slug) {
                continue;
            }
            let Some((timeframe, window_start_ts)) = match_updown_market(raw, &self.timeframes) else {
                continue;
            };
            let market = match parse_gamma_market(raw, timeframe, window_start_ts) {
                Ok(m) => m,
                Err(e) => {
                    warn!(slug, "Skipping market: {e}");
                    continue;
                }
            };
            if market.is_expired(now_secs, self.grace_period_secs) {
                continue;
            }

            let market = Arc::new(market);
            for token in &market.token_ids {
                state.token_index.insert(token.clone(), market.slug.clone());
            }
            state.active.insert(market.slug.clone(), market.clone());
            added.push(market);
        }
        drop(state);

        if !added.is_empty() {
            let slugs: Vec<&str> = added.iter().map(|m| m.slug.as_str()).collect();
            info!(count = added.len(), ?slugs, "Discovered new markets");
        }
        added
    }

    /// Removes every market past `end_date + grace` along with its tokens.
    pub fn expire(&self, now_secs: u64) -> Vec<Arc<Market>> {
        let mut state = self.state.lock();
        let expired_slugs: Vec<String> = state
            .active
            .values()
            .filter(|m| m.is_expired(now_secs, self.grace_period_secs))
            .map(|m| m.slug.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_slugs.len());
        for slug in expired_slugs {
            if let Some(market) = state.active.remove(&slug) {
                for token in &market.token_ids {
                    if state.token_index.get(token) == Some(&slug) {
                        state.token_index.remove(token);
                    }
                }
                expired.push(market);
            }
        }
        drop(state);

        if !expired.is_empty() {
            let slugs: Vec<&str> = expired.iter().map(|m| m.slug.as_str()).collect();
            info!(count = expired.len(), ?slugs, "Expired markets");
        }
        expired
    }

    /// `(market, outcome)` for a tracked token.
    pub fn resolve_token(&self, token_id: &str) -> Option<(Arc<Market>, String)> {
        let state = self.state.lock();
        let slug = state.token_index.get(token_id)?;
        let market = state.active.get(slug)?.clone();
        let outcome = market.outcome_for(token_id).unwrap_or_default().to_string();
        Some((market, outcome))
    }

    pub fn is_tracked(&self, token_id: &str) -> bool {
        self.state.lock().token_index.contains_key(token_id)
    }

    pub fn all_token_ids(&self) -> Vec<String> {
        self.state.lock().token_index.keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::error::AppError;

    /// Serves fixed pages; `fail_at` makes that page index error.
    #[derive(Default)]
    pub struct FakeSource {
        pub pages: Mutex<Vec<Vec<Value>>>,
        pub fail_at: Option<usize>,
        pub offsets: Mutex<Vec<usize>>,
    }

    impl FakeSource {
        pub fn with_pages(pages: Vec<Vec<Value>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                ..Default::default()
            }
        }

        pub fn set_pages(&self, pages: Vec<Vec<Value>>) {
            *self.pages.lock() = pages;
        }
    }

    #[async_trait]
    impl MarketSource for FakeSource {
        async fn open_markets_page(&self, offset: usize) -> Result<Vec<Value>> {
            let mut offsets = self.offsets.lock();
            let index = offsets.len();
            offsets.push(offset);
            if self.fail_at == Some(index) {
                return Err(AppError::Bootstrap("listing unavailable".into()));
            }
            Ok(self.pages.lock().get(index).cloned().unwrap_or_default())
        }
    }

    /// A Gamma market object for `btc-updown-<tf>-<start>` with tokens `<start>1`/`<start>2`.
    pub fn gamma_market(tf: &str, series_tf: &str, start: u64, end_ts: u64) -> Value {
        let end = chrono::DateTime::from_timestamp(end_ts as i64, 0)
            .map(|d| d.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default();
        serde_json::json!({
            "slug": format!("btc-updown-{tf}-{start}"),
            "conditionId": format!("0xcond{start}"),
            "clobTokenIds": format!("[\"{start}1\", \"{start}2\"]"),
            "outcomes": "[\"Up\", \"Down\"]",
            "endDate": end,
            "events": [{"id": format!("ev{start}"), "seriesSlug": format!("btc-up-or-down-{series_tf}")}],
        })
    }
}
