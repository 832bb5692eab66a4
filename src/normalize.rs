use chrono::DateTime;
use num_bigint::BigUint;
use serde_json::Value;

use crate::config::{AMOUNT_DECIMALS, QUOTE_ASSET_ID};
use crate::types::{ChainTradeRow, DecodedLog, Market, Side, Trade};

/// The outcome-token leg of a fill, as seen by the owner of that token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLeg {
    pub side: Side,
    pub token_id: String,
    pub size_raw: u128,
    /// `None` when the counter leg is not the quote asset.
    pub quote_raw: Option<u128>,
}

/// Classifies a fill against a set of tracked outcome tokens.
///
/// Maker holds the token: the maker sold it. Taker holds it: the maker bought it.
/// When both legs are tracked tokens the maker leg wins.
pub fn classify(log: &DecodedLog, is_tracked: impl Fn(&str) -> bool) -> Option<TokenLeg> {
    let maker_id = log.maker_asset_id.to_string();
    let taker_id = log.taker_asset_id.to_string();

    let (side, token_id, size, counter_id, counter_amount) = if is_tracked(&maker_id) {
        (Side::Sell, maker_id, &log.maker_amount_raw, taker_id, &log.taker_amount_raw)
    } else if is_tracked(&taker_id) {
        (Side::Buy, taker_id, &log.taker_amount_raw, maker_id, &log.maker_amount_raw)
    } else {
        return None;
    };

    let quote_raw = if counter_id == QUOTE_ASSET_ID {
        Some(u128::try_from(counter_amount).ok()?)
    } else {
        None
    };

    Some(TokenLeg {
        side,
        token_id,
        size_raw: u128::try_from(size).ok()?,
        quote_raw,
    })
}

/// Token against quote only. Any other asset combination is not a trade of this market.
pub fn classify_strict(log: &DecodedLog, is_tracked: impl Fn(&str) -> bool) -> Option<TokenLeg> {
    classify(log, is_tracked).filter(|leg| leg.quote_raw.is_some())
}

/// Canonical trade from a chain fill. `None` when the token leg has no size or the
/// block timestamp does not fit in milliseconds.
pub fn chain_trade(
    log: &DecodedLog,
    leg: &TokenLeg,
    market: &Market,
    block_timestamp: u64,
    received_ms: Option<u64>,
) -> Option<Trade> {
    let size = scaled(leg.size_raw);
    if size <= 0.0 {
        return None;
    }
    let timestamp_ms = block_timestamp.checked_mul(1000)?.checked_add(log.log_index)?;
    let notional = leg.quote_raw.map(|q| round10(scaled(q)));
    let price = leg.quote_raw.map(|q| round10(scaled(q) / size));
    let size = round10(size);

    let dedupe_key = dedupe_key(
        &log.tx_hash,
        &leg.token_id,
        leg.side,
        block_timestamp,
        price.unwrap_or(0.0),
        size,
    );

    Some(Trade {
        market_slug: market.slug.clone(),
        window_start_ts: market.window_start_ts,
        condition_id: market.condition_id.clone(),
        event_id: market.event_id.clone(),
        trade_timestamp: block_timestamp,
        trade_utc: ts_to_utc(block_timestamp),
        price,
        size,
        notional,
        side: leg.side,
        outcome: market.outcome_for(&leg.token_id).unwrap_or_default().to_string(),
        asset: leg.token_id.clone(),
        proxy_wallet: log.maker.clone(),
        transaction_hash: log.tx_hash.clone(),
        dedupe_key,
        timestamp_ms: Some(timestamp_ms),
        server_received_ms: received_ms,
        trade_time_ms: Some(ms_to_utc(timestamp_ms)),
    })
}

/// Audit row for the strict backfill. Amounts are exact decimal strings.
pub fn chain_row(log: &DecodedLog, leg: &TokenLeg, market: &Market, block_timestamp: u64) -> ChainTradeRow {
    let size = BigUint::from(leg.size_raw);
    let notional = BigUint::from(leg.quote_raw.unwrap_or(0));
    ChainTradeRow {
        market_slug: market.slug.clone(),
        condition_id: market.condition_id.clone(),
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index,
        log_uid: log.log_uid(),
        block_number: log.block_number,
        trade_timestamp: block_timestamp,
        trade_utc: ts_to_utc(block_timestamp),
        proxy_wallet: log.maker.clone(),
        side: leg.side,
        outcome: market.outcome_for(&leg.token_id).unwrap_or_default().to_string(),
        asset: leg.token_id.clone(),
        size: format_scaled(&size, AMOUNT_DECIMALS),
        price: format_ratio(&notional, &size, 18),
        notional: format_scaled(&notional, AMOUNT_DECIMALS),
        fee: format_scaled(&log.fee_raw, AMOUNT_DECIMALS),
        maker_asset_id: log.maker_asset_id.to_string(),
        taker_asset_id: log.taker_asset_id.to_string(),
        maker_amount_raw: log.maker_amount_raw.to_string(),
        taker_amount_raw: log.taker_amount_raw.to_string(),
        fee_raw: log.fee_raw.to_string(),
    }
}

/// Canonical trade from a Data API `/trades` record.
pub fn rest_trade(raw: &Value, market: &Market) -> Option<Trade> {
    let timestamp = raw.get("timestamp").map(json_u64).unwrap_or(0);
    let size = raw.get("size").and_then(json_f64).unwrap_or(0.0);
    if size <= 0.0 {
        return None;
    }
    let price = raw.get("price").and_then(json_f64).unwrap_or(0.0);
    let side = raw.get("side").and_then(|s| s.as_str()).and_then(Side::parse)?;
    let transaction_hash = str_field(raw, "transactionHash");
    let asset = str_field(raw, "asset");

    Some(Trade {
        market_slug: market.slug.clone(),
        window_start_ts: market.window_start_ts,
        condition_id: market.condition_id.clone(),
        event_id: market.event_id.clone(),
        trade_timestamp: timestamp,
        trade_utc: if timestamp > 0 { ts_to_utc(timestamp) } else { String::new() },
        price: Some(price),
        size,
        notional: Some(round10(size * price)),
        side,
        outcome: str_field(raw, "outcome"),
        dedupe_key: dedupe_key(&transaction_hash, &asset, side, timestamp, price, size),
        asset,
        proxy_wallet: str_field(raw, "proxyWallet"),
        transaction_hash,
        timestamp_ms: None,
        server_received_ms: None,
        trade_time_ms: None,
    })
}

/// Stable identity for idempotent storage: `tx|asset|side|ts|price|size`.
pub fn dedupe_key(tx_hash: &str, asset: &str, side: Side, timestamp: u64, price: f64, size: f64) -> String {
    format!("{tx_hash}|{asset}|{side}|{timestamp}|{price:.10}|{size:.10}")
}

fn scaled(raw: u128) -> f64 {
    raw as f64 / 10f64.powi(AMOUNT_DECIMALS as i32)
}

fn round10(x: f64) -> f64 {
    (x * 1e10).round() / 1e10
}

/// `raw / 10^decimals` as a plain decimal string, trailing zeros trimmed.
pub fn format_scaled(raw: &BigUint, decimals: u32) -> String {
    let digits = raw.to_string();
    let decimals = decimals as usize;
    let padded = if digits.len() <= decimals {
        format!("{}{digits}", "0".repeat(decimals + 1 - digits.len()))
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac_part}")
    }
}

/// `num / den` truncated to `places` decimals. Zero denominator formats as `0`.
pub fn format_ratio(num: &BigUint, den: &BigUint, places: u32) -> String {
    if den.bits() == 0 {
        return "0".to_string();
    }
    let scaled = num * BigUint::from(10u32).pow(places) / den;
    format_scaled(&scaled, places)
}

pub fn ts_to_utc(ts: u64) -> String {
    DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

pub fn ms_to_utc(ms: u64) -> String {
    DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_default()
}

fn json_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_u64(v: &Value) -> u64 {
    v.as_u64()
        .or_else(|| v.as_f64().map(|f| f as u64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()).map(|f| f as u64))
        .unwrap_or(0)
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|s| s.as_str()).unwrap_or("").to_string()
}
