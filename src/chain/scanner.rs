use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::chain::blocks::BlockTimeResolver;
use crate::chain::decoder::{address_to_topic, decode_order_filled};
use crate::chain::rpc::LogFilter;
use crate::config::{
    CTF_EXCHANGE, DEFAULT_INITIAL_SPAN_BLOCKS, DEFAULT_MIN_SPAN_BLOCKS, ORDER_FILLED_TOPIC0,
    SCAN_PROGRESS_EVERY_RANGES, SPAN_RECOVERY_MAX_LOGS,
};
use crate::error::Result;
use crate::normalize::{chain_row, classify_strict};
use crate::types::{BlockRange, ChainTradeRow, Market};

#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    pub initial_span: u64,
    pub min_span: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            initial_span: DEFAULT_INITIAL_SPAN_BLOCKS,
            min_span: DEFAULT_MIN_SPAN_BLOCKS,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Unique by `log_uid`, ordered by `(trade_timestamp, block_number, log_index)`.
    pub rows: Vec<ChainTradeRow>,
    /// Completed windows in scan order; contiguous over the requested range.
    pub ranges: Vec<BlockRange>,
    pub logs_scanned: usize,
    pub decoded_logs: usize,
    /// Decoded fills that were not token-vs-quote trades of this market.
    pub unmatched_logs: usize,
    /// Rows dropped because their `log_uid` was already collected.
    pub duplicates_removed: usize,
    pub span_shrinks: usize,
}

impl ScanOutcome {
    /// Fills that classified as trades of the market, before de-duplication.
    pub fn matched_logs(&self) -> usize {
        self.decoded_logs - self.unmatched_logs
    }
}

/// Scans `[start_block, end_block]` for strict trades of `market`.
///
/// Windows start at `initial_span` blocks. A capacity error halves the span (not below
/// `min_span`) and retries the same window; at `min_span` it is fatal, as is any other
/// error. After a window succeeds a shrunk span doubles back toward `initial_span`
/// unless the page was dense.
pub async fn scan_market_trades(
    resolver: &BlockTimeResolver,
    market: &Market,
    start_block: u64,
    end_block: u64,
    config: ScanConfig,
) -> Result<ScanOutcome> {
    let initial_span = config.initial_span.max(1);
    let min_span = config.min_span.clamp(1, initial_span);
    let taker_topic = address_to_topic(CTF_EXCHANGE);

    let mut out = ScanOutcome::default();
    let mut span = initial_span;
    let mut cursor = start_block;

    while cursor <= end_block {
        let to_block = cursor.saturating_add(span - 1).min(end_block);
        let filter = LogFilter::new(
            &[CTF_EXCHANGE],
            cursor,
            to_block,
            vec![
                Some(ORDER_FILLED_TOPIC0.to_string()),
                None,
                None,
                Some(taker_topic.clone()),
            ],
        );

        let logs = match resolver.rpc().get_logs(&filter).await {
            Ok(logs) => logs,
            Err(e) if e.is_span_too_wide() && span > min_span => {
                let next = (span / 2).max(min_span);
                warn!(from = cursor, to = to_block, span, next, "Log window too wide, shrinking: {e}");
                span = next;
                out.span_shrinks += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        for raw in &logs {
            let Some(log) = decode_order_filled(raw) else {
                continue;
            };
            out.decoded_logs += 1;
            if log.taker != CTF_EXCHANGE {
                out.unmatched_logs += 1;
                continue;
            }
            let leg = match classify_strict(&log, |id| market.outcome_for(id).is_some()) {
                Some(leg) if leg.size_raw > 0 => leg,
                _ => {
                    out.unmatched_logs += 1;
                    continue;
                }
            };
            let ts = match log.block_timestamp {
                Some(ts) => ts,
                None => resolver.timestamp(log.block_number).await?,
            };
            out.rows.push(chain_row(&log, &leg, market, ts));
        }

        out.logs_scanned += logs.len();
        out.ranges.push(BlockRange {
            start_block: cursor,
            end_block: to_block,
            logs_count: logs.len(),
        });
        debug!(from = cursor, to = to_block, logs = logs.len(), "Scanned window");

        if out.ranges.len() % SCAN_PROGRESS_EVERY_RANGES == 0 {
            info!(
                slug = %market.slug,
                ranges = out.ranges.len(),
                cursor = to_block,
                end_block,
                trades = out.rows.len(),
                span,
                "Scan progress"
            );
        }

        cursor = to_block + 1;
        if span < initial_span && logs.len() < SPAN_RECOVERY_MAX_LOGS {
            span = (span * 2).min(initial_span);
        }
    }

    let collected = out.rows.len();
    let mut seen = HashSet::with_capacity(collected);
    out.rows.retain(|row| seen.insert(row.log_uid.clone()));
    out.duplicates_removed = collected - out.rows.len();
    out.rows
        .sort_by_key(|r| (r.trade_timestamp, r.block_number, r.log_index));
    Ok(out)
}
