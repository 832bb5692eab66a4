use std::collections::HashMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::timeframes::Timeframe;

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// A live (or backfilled) BTC up/down market.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub slug: String,
    pub timeframe: Timeframe,
    pub event_id: String,
    pub window_start_ts: u64,
    pub condition_id: String,
    /// Parallel to `outcomes`.
    pub token_ids: Vec<String>,
    pub outcomes: Vec<String>,
    pub end_date_utc: String,
    /// Unix seconds; 0 when the listing carried no parseable end date.
    pub end_date_ts: u64,
    token_to_outcome: HashMap<String, String>,
}

impl Market {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slug: String,
        timeframe: Timeframe,
        event_id: String,
        window_start_ts: u64,
        condition_id: String,
        token_ids: Vec<String>,
        outcomes: Vec<String>,
        end_date_utc: String,
        end_date_ts: u64,
    ) -> Result<Self> {
        if token_ids.len() != outcomes.len() {
            return Err(AppError::Bootstrap(format!(
                "token/outcome length mismatch: {} != {} for {slug}",
                token_ids.len(),
                outcomes.len()
            )));
        }
        let mut token_to_outcome = HashMap::with_capacity(token_ids.len());
        for (token, outcome) in token_ids.iter().zip(&outcomes) {
            if token_to_outcome.insert(token.clone(), outcome.clone()).is_some() {
                return Err(AppError::Bootstrap(format!("duplicate token id {token} in {slug}")));
            }
        }
        Ok(Self {
            slug,
            timeframe,
            event_id,
            window_start_ts,
            condition_id,
            token_ids,
            outcomes,
            end_date_utc,
            end_date_ts,
            token_to_outcome,
        })
    }

    pub fn outcome_for(&self, token_id: &str) -> Option<&str> {
        self.token_to_outcome.get(token_id).map(String::as_str)
    }

    pub fn token_to_outcome(&self) -> &HashMap<String, String> {
        &self.token_to_outcome
    }

    /// `now > end + grace`. Markets without an end date never expire.
    pub fn is_expired(&self, now_secs: u64, grace_secs: u64) -> bool {
        self.end_date_ts > 0 && now_secs > self.end_date_ts + grace_secs
    }
}

// ---------------------------------------------------------------------------
// Chain records
// ---------------------------------------------------------------------------

/// One decoded `OrderFilled` log. Identity is `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub address: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    /// Present only when the provider includes `blockTimestamp` in log objects.
    pub block_timestamp: Option<u64>,
    pub maker: String,
    pub taker: String,
    pub maker_asset_id: BigUint,
    pub taker_asset_id: BigUint,
    pub maker_amount_raw: BigUint,
    pub taker_amount_raw: BigUint,
    pub fee_raw: BigUint,
}

impl DecodedLog {
    pub fn log_uid(&self) -> String {
        format!("{}:{}", self.tx_hash, self.log_index)
    }
}

/// One completed `eth_getLogs` window of a backfill scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    pub start_block: u64,
    pub end_block: u64,
    pub logs_count: usize,
}

/// Queued by the head feed for the block processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadEvent {
    pub block_number: u64,
    /// 0 when the head notification carried no timestamp.
    pub block_timestamp: u64,
    pub received_ms: u64,
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical trade record emitted to every sink. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub market_slug: String,
    pub window_start_ts: u64,
    pub condition_id: String,
    pub event_id: String,
    pub trade_timestamp: u64,
    pub trade_utc: String,
    pub price: Option<f64>,
    pub size: f64,
    pub notional: Option<f64>,
    pub side: Side,
    pub outcome: String,
    pub asset: String,
    pub proxy_wallet: String,
    pub transaction_hash: String,
    pub dedupe_key: String,
    /// `block_ts * 1000 + log_index` for chain-sourced trades.
    pub timestamp_ms: Option<u64>,
    pub server_received_ms: Option<u64>,
    pub trade_time_ms: Option<String>,
}

/// Strict backfill row: a `Trade` plus the raw log fields needed to audit it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainTradeRow {
    pub market_slug: String,
    pub condition_id: String,
    pub tx_hash: String,
    pub log_index: u64,
    pub log_uid: String,
    pub block_number: u64,
    pub trade_timestamp: u64,
    pub trade_utc: String,
    pub proxy_wallet: String,
    pub side: Side,
    pub outcome: String,
    pub asset: String,
    pub size: String,
    pub price: String,
    pub notional: String,
    pub fee: String,
    pub maker_asset_id: String,
    pub taker_asset_id: String,
    pub maker_amount_raw: String,
    pub taker_amount_raw: String,
    pub fee_raw: String,
}
