use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use num_bigint::BigUint;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::chain::blocks::BlockTimeResolver;
use crate::chain::rpc::ChainRpc;
use crate::chain::scanner::{scan_market_trades, ScanConfig, ScanOutcome};
use crate::config::AMOUNT_DECIMALS;
use crate::error::{AppError, Result};
use crate::fetcher::{market_from_slug_payload, unix_field};
use crate::normalize::{format_scaled, ts_to_utc};
use crate::sink::write_rows;
use crate::state::tracker::now_secs;
use crate::types::{BlockRange, ChainTradeRow, Side};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub scan: ScanConfig,
    pub buffer_before_secs: u64,
    pub buffer_after_secs: u64,
    pub compare_csv: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Endpoints in use, echoed into the report.
    pub rpc_urls: Vec<String>,
}

#[derive(Debug)]
pub struct BackfillOutput {
    pub trades_csv: PathBuf,
    pub validation_json: PathBuf,
    pub report: ValidationReport,
}

/// `[max(1, createdAt - before), max(closedTime, endDate) + after]` in unix seconds.
pub fn scan_window(raw: &Value, buffer_before_secs: u64, buffer_after_secs: u64) -> Result<(u64, u64)> {
    let created = unix_field(raw, "createdAt");
    let end = unix_field(raw, "closedTime").max(unix_field(raw, "endDate"));
    if created == 0 || end == 0 {
        return Err(AppError::Bootstrap(
            "Cannot resolve created/end timestamps from market metadata".to_string(),
        ));
    }
    Ok((
        created.saturating_sub(buffer_before_secs).max(1),
        end + buffer_after_secs,
    ))
}

/// Strict on-chain backfill of one market, given its Gamma object.
pub async fn backfill_market(raw: &Value, rpc: Arc<dyn ChainRpc>, opts: &BackfillOptions) -> Result<BackfillOutput> {
    let market = market_from_slug_payload(raw)?;
    let (scan_start_ts, scan_end_ts) = scan_window(raw, opts.buffer_before_secs, opts.buffer_after_secs)?;

    let resolver = BlockTimeResolver::new(rpc);
    let latest = resolver.rpc().block_number().await?;
    let start_block = resolver.first_block_with_ts_ge(scan_start_ts, latest).await?;
    let end_block = resolver.last_block_with_ts_le(scan_end_ts, latest).await?;
    if end_block < start_block {
        return Err(AppError::Bootstrap(format!(
            "Invalid block range: {start_block}..{end_block}"
        )));
    }
    info!(
        market = %market.slug,
        condition_id = %market.condition_id,
        scan_start_ts,
        scan_end_ts,
        start_block,
        end_block,
        "Backfill window resolved"
    );

    let outcome = scan_market_trades(&resolver, &market, start_block, end_block, opts.scan).await?;

    let dir = opts.output_dir.join(&market.slug);
    let trades_csv = dir.join(format!("strict_trades_{}.csv", market.slug));
    let validation_json = dir.join(format!("strict_validation_{}.json", market.slug));
    write_rows(&trades_csv, &outcome.rows)?;

    let compare = match &opts.compare_csv {
        Some(path) => Some(compare_with_existing_csv(path, &outcome.rows)?),
        None => None,
    };
    let window = ScanWindow {
        scan_start_ts,
        scan_end_ts,
        start_block,
        end_block,
    };
    let token_to_outcome: BTreeMap<String, String> = market
        .token_to_outcome()
        .iter()
        .map(|(token, outcome)| (token.clone(), outcome.clone()))
        .collect();
    let report = build_report(raw, &token_to_outcome, &opts.rpc_urls, window, &outcome, compare);
    fs::write(&validation_json, serde_json::to_string_pretty(&report)?)?;

    info!(
        market = %market.slug,
        rows = outcome.rows.len(),
        ranges = outcome.ranges.len(),
        shrinks = outcome.span_shrinks,
        csv = %trades_csv.display(),
        validation = %validation_json.display(),
        "Backfill complete"
    );
    Ok(BackfillOutput {
        trades_csv,
        validation_json,
        report,
    })
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ScanWindow {
    scan_start_ts: u64,
    scan_end_ts: u64,
    start_block: u64,
    end_block: u64,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub generated_at: String,
    pub market: MarketSection,
    pub rpc: RpcSection,
    pub scan: ScanSection,
    pub strict_trades: TradesSection,
    pub compare_with_existing_csv: Option<CompareSection>,
}

/// Metadata echoed from the Gamma object as-is.
#[derive(Debug, Serialize)]
pub struct MarketSection {
    pub slug: Option<Value>,
    pub condition_id: Option<Value>,
    pub created_at: Option<Value>,
    pub end_date: Option<Value>,
    pub closed_time: Option<Value>,
    pub event_start_time: Option<Value>,
    pub volume: Option<Value>,
    pub volume_clob: Option<Value>,
    pub token_to_outcome: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct RpcSection {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ScanSection {
    pub scan_start_ts: u64,
    pub scan_start_utc: String,
    pub scan_end_ts: u64,
    pub scan_end_utc: String,
    pub start_block: u64,
    pub end_block: u64,
    pub ranges_total: usize,
    pub ranges_contiguous: bool,
    pub total_blocks_scanned: u64,
    pub orderfilled_taker_logs_scanned: usize,
    pub matched_market_logs: usize,
}

#[derive(Debug, Serialize)]
pub struct TradesSection {
    pub rows: usize,
    pub unique_log_uids: usize,
    pub duplicates_removed: usize,
    pub unique_tx_hashes: usize,
    pub first_trade_ts: Option<u64>,
    pub last_trade_ts: Option<u64>,
    pub first_trade_utc: Option<String>,
    pub last_trade_utc: Option<String>,
    pub side_breakdown: BTreeMap<String, usize>,
    pub outcome_breakdown: BTreeMap<String, usize>,
    pub notional_sum: String,
    pub double_notional_sum: String,
    pub double_notional_vs_market_volume_ratio: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CompareSection {
    Missing {
        path: String,
        exists: bool,
        error: String,
    },
    Found {
        path: String,
        exists: bool,
        rows_existing: usize,
        rows_new: usize,
        unique_tx_existing: usize,
        unique_tx_new: usize,
        tx_only_in_new: usize,
        tx_only_in_existing: usize,
        existing_first_ts: Option<u64>,
        existing_last_ts: Option<u64>,
        new_first_ts: Option<u64>,
        new_last_ts: Option<u64>,
    },
}

/// True when each range starts right after the previous one ended.
pub fn ranges_contiguous(ranges: &[BlockRange]) -> bool {
    ranges.windows(2).all(|w| w[1].start_block == w[0].end_block + 1)
}

/// Raw quote amount of a strict row: the counter leg of the token.
fn quote_raw(row: &ChainTradeRow) -> BigUint {
    let raw = match row.side {
        Side::Sell => &row.taker_amount_raw,
        Side::Buy => &row.maker_amount_raw,
    };
    raw.parse().unwrap_or_default()
}

fn json_number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_report(
    raw: &Value,
    token_to_outcome: &BTreeMap<String, String>,
    rpc_urls: &[String],
    window: ScanWindow,
    outcome: &ScanOutcome,
    compare: Option<CompareSection>,
) -> ValidationReport {
    let rows = &outcome.rows;
    let uids: HashSet<&str> = rows.iter().map(|r| r.log_uid.as_str()).collect();
    let txs: HashSet<&str> = rows.iter().map(|r| r.tx_hash.as_str()).collect();
    let first_ts = rows.iter().map(|r| r.trade_timestamp).min();
    let last_ts = rows.iter().map(|r| r.trade_timestamp).max();

    let mut side_breakdown = BTreeMap::new();
    let mut outcome_breakdown = BTreeMap::new();
    let mut notional = BigUint::default();
    for row in rows {
        *side_breakdown.entry(row.side.to_string()).or_insert(0) += 1;
        *outcome_breakdown.entry(row.outcome.clone()).or_insert(0) += 1;
        notional += quote_raw(row);
    }
    let double_notional = &notional * 2u32;

    let scale = 10f64.powi(AMOUNT_DECIMALS as i32);
    let double_notional_f = format_scaled(&double_notional, AMOUNT_DECIMALS)
        .parse::<f64>()
        .unwrap_or(0.0);
    let volume_ratio = json_number(raw.get("volume"))
        .filter(|v| *v > 0.0)
        .map(|v| (double_notional_f / v * scale).round() / scale);

    ValidationReport {
        generated_at: ts_to_utc(now_secs()),
        market: MarketSection {
            slug: raw.get("slug").cloned(),
            condition_id: raw.get("conditionId").cloned(),
            created_at: raw.get("createdAt").cloned(),
            end_date: raw.get("endDate").cloned(),
            closed_time: raw.get("closedTime").cloned(),
            event_start_time: raw.get("eventStartTime").cloned(),
            volume: raw.get("volume").cloned(),
            volume_clob: raw.get("volumeClob").cloned(),
            token_to_outcome: token_to_outcome.clone(),
        },
        rpc: RpcSection {
            urls: rpc_urls.to_vec(),
        },
        scan: ScanSection {
            scan_start_ts: window.scan_start_ts,
            scan_start_utc: ts_to_utc(window.scan_start_ts),
            scan_end_ts: window.scan_end_ts,
            scan_end_utc: ts_to_utc(window.scan_end_ts),
            start_block: window.start_block,
            end_block: window.end_block,
            ranges_total: outcome.ranges.len(),
            ranges_contiguous: ranges_contiguous(&outcome.ranges),
            total_blocks_scanned: outcome
                .ranges
                .iter()
                .map(|r| r.end_block - r.start_block + 1)
                .sum(),
            orderfilled_taker_logs_scanned: outcome.logs_scanned,
            matched_market_logs: outcome.matched_logs(),
        },
        strict_trades: TradesSection {
            rows: rows.len(),
            unique_log_uids: uids.len(),
            duplicates_removed: outcome.duplicates_removed,
            unique_tx_hashes: txs.len(),
            first_trade_ts: first_ts,
            last_trade_ts: last_ts,
            first_trade_utc: first_ts.map(ts_to_utc),
            last_trade_utc: last_ts.map(ts_to_utc),
            side_breakdown,
            outcome_breakdown,
            notional_sum: format_scaled(&notional, AMOUNT_DECIMALS),
            double_notional_sum: format_scaled(&double_notional, AMOUNT_DECIMALS),
            double_notional_vs_market_volume_ratio: volume_ratio,
        },
        compare_with_existing_csv: compare,
    }
}

/// Transaction overlap and time span against a previously exported CSV. Accepts either
/// the canonical trade columns or the strict ones.
pub fn compare_with_existing_csv(path: &Path, new_rows: &[ChainTradeRow]) -> Result<CompareSection> {
    let path_str = path.display().to_string();
    if !path.exists() {
        return Ok(CompareSection::Missing {
            path: path_str,
            exists: false,
            error: "file_not_found".to_string(),
        });
    }

    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |names: &[&str]| names.iter().find_map(|n| headers.iter().position(|h| h == *n));
    let tx_col = column(&["transaction_hash", "tx_hash"]);
    let ts_col = column(&["trade_timestamp", "timestamp"]);

    let mut rows_existing = 0usize;
    let mut old_tx = HashSet::new();
    let mut old_ts = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows_existing += 1;
        if let Some(tx) = tx_col.and_then(|c| record.get(c)).filter(|s| !s.is_empty()) {
            old_tx.insert(tx.to_lowercase());
        }
        if let Some(ts) = ts_col
            .and_then(|c| record.get(c))
            .and_then(|s| s.trim().parse::<f64>().ok())
        {
            old_ts.push(ts as u64);
        }
    }

    let new_tx: HashSet<String> = new_rows
        .iter()
        .filter(|r| !r.tx_hash.is_empty())
        .map(|r| r.tx_hash.to_lowercase())
        .collect();

    Ok(CompareSection::Found {
        path: path_str,
        exists: true,
        rows_existing,
        rows_new: new_rows.len(),
        unique_tx_existing: old_tx.len(),
        unique_tx_new: new_tx.len(),
        tx_only_in_new: new_tx.difference(&old_tx).count(),
        tx_only_in_existing: old_tx.difference(&new_tx).count(),
        existing_first_ts: old_ts.iter().copied().min(),
        existing_last_ts: old_ts.iter().copied().max(),
        new_first_ts: new_rows.iter().map(|r| r.trade_timestamp).min(),
        new_last_ts: new_rows.iter().map(|r| r.trade_timestamp).max(),
    })
}
