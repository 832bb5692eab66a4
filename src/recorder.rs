use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{Config, CHANNEL_CAPACITY, RECORDER_POLL_INTERVAL_SECS};
use crate::error::{AppError, Result};
use crate::fetcher::RestClient;
use crate::normalize::ms_to_utc;
use crate::sink::{CsvRow, CsvSink};
use crate::state::MarketTracker;
use crate::stream::now_ms;
use crate::types::Market;
use crate::ws::clob::ClobFeed;
use crate::ws::messages::{parse_feed_event, FeedEvent};
use crate::ws::{TransportCommand, TransportEvent, TransportManager};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookLevelRow {
    pub snapshot_seq: u64,
    pub server_ts_ms: String,
    pub receive_ts_ms: u64,
    pub receive_utc: String,
    pub asset_id: String,
    pub outcome: String,
    pub condition_id: String,
    /// "bid" or "ask".
    pub side: &'static str,
    pub price: String,
    pub size: String,
    pub level_index: usize,
}

impl CsvRow for BookLevelRow {
    const HEADERS: &'static [&'static str] = &[
        "snapshot_seq",
        "server_ts_ms",
        "receive_ts_ms",
        "receive_utc",
        "asset_id",
        "outcome",
        "condition_id",
        "side",
        "price",
        "size",
        "level_index",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChangeRow {
    pub server_ts_ms: String,
    pub receive_ts_ms: u64,
    pub receive_utc: String,
    pub condition_id: String,
    pub asset_id: String,
    pub outcome: String,
    pub side: String,
    pub price: String,
    pub size: String,
    pub best_bid: String,
    pub best_ask: String,
}

impl CsvRow for PriceChangeRow {
    const HEADERS: &'static [&'static str] = &[
        "server_ts_ms",
        "receive_ts_ms",
        "receive_utc",
        "condition_id",
        "asset_id",
        "outcome",
        "side",
        "price",
        "size",
        "best_bid",
        "best_ask",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastTradeRow {
    pub server_ts_ms: String,
    pub receive_ts_ms: u64,
    pub receive_utc: String,
    pub condition_id: String,
    pub asset_id: String,
    pub outcome: String,
    pub side: String,
    pub price: String,
    pub size: String,
    pub fee_rate_bps: String,
}

impl CsvRow for LastTradeRow {
    const HEADERS: &'static [&'static str] = &[
        "server_ts_ms",
        "receive_ts_ms",
        "receive_utc",
        "condition_id",
        "asset_id",
        "outcome",
        "side",
        "price",
        "size",
        "fee_rate_bps",
    ];
}

/// The three append-only files of one market.
struct MarketWriters {
    books: CsvSink<BookLevelRow>,
    price_changes: CsvSink<PriceChangeRow>,
    trades: CsvSink<LastTradeRow>,
    snapshot_seq: u64,
}

impl MarketWriters {
    fn open(dir: &Path, slug: &str) -> Result<Self> {
        Ok(Self {
            books: CsvSink::open(dir.join(format!("book_snapshots_{slug}.csv")))?,
            price_changes: CsvSink::open(dir.join(format!("price_changes_{slug}.csv")))?,
            trades: CsvSink::open(dir.join(format!("trades_{slug}.csv")))?,
            snapshot_seq: 0,
        })
    }

    fn flush(&self) -> Result<()> {
        self.books.flush()?;
        self.price_changes.flush()?;
        self.trades.flush()
    }
}

/// Routes market-channel events to per-market CSV writers. Rows are relayed verbatim.
pub struct BookRecorder {
    tracker: Arc<MarketTracker>,
    root: PathBuf,
    writers: HashMap<String, MarketWriters>,
}

impl BookRecorder {
    pub fn new(tracker: Arc<MarketTracker>, output_dir: &Path) -> Self {
        Self {
            tracker,
            root: output_dir.join("orderbook"),
            writers: HashMap::new(),
        }
    }

    pub fn market_dir(&self, slug: &str) -> PathBuf {
        self.root.join(slug)
    }

    pub fn open_market(&mut self, market: &Market) -> Result<()> {
        if self.writers.contains_key(&market.slug) {
            return Ok(());
        }
        let writers = MarketWriters::open(&self.market_dir(&market.slug), &market.slug)?;
        self.writers.insert(market.slug.clone(), writers);
        info!(market = %market.slug, tokens = market.token_ids.len(), "Recording market");
        Ok(())
    }

    pub fn close_market(&mut self, slug: &str) {
        if let Some(writers) = self.writers.remove(slug) {
            if let Err(e) = writers.flush() {
                error!(market = slug, "Flush on close failed: {e}");
            }
            info!(market = slug, "Stopped recording market");
        }
    }

    pub fn open_count(&self) -> usize {
        self.writers.len()
    }

    /// `(writers, outcome, condition_id)` for a token of a recorded market.
    fn route(&mut self, asset_id: &str) -> Option<(&mut MarketWriters, String, String)> {
        let (market, outcome) = self.tracker.resolve_token(asset_id)?;
        let writers = self.writers.get_mut(&market.slug)?;
        Some((writers, outcome, market.condition_id.clone()))
    }

    /// Writes one event; returns the number of rows written. Unknown tokens are skipped.
    pub fn handle_event(&mut self, event: &FeedEvent, receive_ms: u64) -> Result<usize> {
        let receive_utc = ms_to_utc(receive_ms);
        match event {
            FeedEvent::Book {
                asset_id,
                condition_id,
                server_ts_ms,
                bids,
                asks,
            } => {
                let Some((writers, outcome, market_condition)) = self.route(asset_id) else {
                    return Ok(0);
                };
                writers.snapshot_seq += 1;
                let seq = writers.snapshot_seq;
                let condition_id = if condition_id.is_empty() { market_condition } else { condition_id.clone() };
                let levels = bids
                    .iter()
                    .enumerate()
                    .map(|(i, l)| ("bid", i, l))
                    .chain(asks.iter().enumerate().map(|(i, l)| ("ask", i, l)));
                let mut rows = 0;
                for (side, level_index, level) in levels {
                    writers.books.append(&BookLevelRow {
                        snapshot_seq: seq,
                        server_ts_ms: server_ts_ms.clone(),
                        receive_ts_ms: receive_ms,
                        receive_utc: receive_utc.clone(),
                        asset_id: asset_id.clone(),
                        outcome: outcome.clone(),
                        condition_id: condition_id.clone(),
                        side,
                        price: level.price.clone(),
                        size: level.size.clone(),
                        level_index,
                    })?;
                    rows += 1;
                }
                Ok(rows)
            }
            FeedEvent::PriceChange {
                condition_id,
                server_ts_ms,
                changes,
            } => {
                let mut rows = 0;
                for change in changes {
                    let Some((writers, outcome, market_condition)) = self.route(&change.asset_id) else {
                        continue;
                    };
                    writers.price_changes.append(&PriceChangeRow {
                        server_ts_ms: server_ts_ms.clone(),
                        receive_ts_ms: receive_ms,
                        receive_utc: receive_utc.clone(),
                        condition_id: if condition_id.is_empty() { market_condition } else { condition_id.clone() },
                        asset_id: change.asset_id.clone(),
                        outcome,
                        side: change.side.clone(),
                        price: change.price.clone(),
                        size: change.size.clone(),
                        best_bid: change.best_bid.clone(),
                        best_ask: change.best_ask.clone(),
                    })?;
                    rows += 1;
                }
                Ok(rows)
            }
            FeedEvent::LastTrade {
                asset_id,
                condition_id,
                server_ts_ms,
                side,
                price,
                size,
                fee_rate_bps,
            } => {
                let Some((writers, outcome, market_condition)) = self.route(asset_id) else {
                    return Ok(0);
                };
                writers.trades.append(&LastTradeRow {
                    server_ts_ms: server_ts_ms.clone(),
                    receive_ts_ms: receive_ms,
                    receive_utc,
                    condition_id: if condition_id.is_empty() { market_condition } else { condition_id.clone() },
                    asset_id: asset_id.clone(),
                    outcome,
                    side: side.clone(),
                    price: price.clone(),
                    size: size.clone(),
                    fee_rate_bps: fee_rate_bps.clone(),
                })?;
                Ok(1)
            }
        }
    }

    pub fn flush_all(&self) {
        for (slug, writers) in &self.writers {
            if let Err(e) = writers.flush() {
                error!(market = %slug, "Flush failed: {e}");
            }
        }
    }
}

async fn send_command(commands: &mpsc::Sender<TransportCommand>, cmd: TransportCommand) -> Result<()> {
    commands
        .send(cmd)
        .await
        .map_err(|e| AppError::ChannelSend(e.to_string()))
}

/// Applies one discovery result: open and subscribe new markets, unsubscribe and close
/// expired ones.
async fn apply_poll(
    recorder: &mut BookRecorder,
    commands: &mpsc::Sender<TransportCommand>,
    added: &[Arc<Market>],
    expired: &[Arc<Market>],
) -> Result<()> {
    for market in added {
        recorder.open_market(market)?;
    }
    let new_tokens: Vec<String> = added.iter().flat_map(|m| m.token_ids.iter().cloned()).collect();
    if !new_tokens.is_empty() {
        send_command(commands, TransportCommand::Subscribe(new_tokens)).await?;
    }

    let gone_tokens: Vec<String> = expired.iter().flat_map(|m| m.token_ids.iter().cloned()).collect();
    if !gone_tokens.is_empty() {
        send_command(commands, TransportCommand::Unsubscribe(gone_tokens)).await?;
    }
    for market in expired {
        recorder.close_market(&market.slug);
    }
    Ok(())
}

/// `record`: order-book snapshots, level changes and last trades for every tracked market.
pub async fn run_recorder(cfg: Config, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let rest = Arc::new(RestClient::new(&cfg)?);
    let tracker = Arc::new(MarketTracker::new(rest, cfg.timeframes.clone(), cfg.grace_period_secs));
    let mut recorder = BookRecorder::new(Arc::clone(&tracker), &cfg.output_dir);

    let (added, _) = tracker.poll_once().await;
    for market in &added {
        recorder.open_market(market)?;
    }
    info!(markets = added.len(), "Initial discovery complete");

    let (manager, mut handle) =
        TransportManager::new(cfg.clob_ws_url.clone(), ClobFeed, shutdown.clone(), CHANNEL_CAPACITY);
    let manager = manager.with_subscriptions(tracker.all_token_ids());
    let transport = tokio::spawn(manager.run());

    let mut ticker = interval(Duration::from_secs(RECORDER_POLL_INTERVAL_SECS));
    ticker.tick().await;

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(TransportEvent::Message(payload)) => {
                    let Some(event) = parse_feed_event(&payload) else {
                        continue;
                    };
                    if let Err(e) = recorder.handle_event(&event, now_ms()) {
                        error!("Recorder write failed: {e}");
                    }
                }
                Some(TransportEvent::Connected) => info!("Market feed connected"),
                Some(TransportEvent::Disconnected) => warn!("Market feed disconnected"),
                None => break,
            },
            _ = ticker.tick() => {
                let (added, expired) = tracker.poll_once().await;
                if let Err(e) = apply_poll(&mut recorder, &handle.commands, &added, &expired).await {
                    error!("Applying discovery result failed: {e}");
                }
                info!(recording = recorder.open_count(), active = tracker.active_count(), "Discovery tick");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    recorder.flush_all();
    drop(handle);
    if tokio::time::timeout(Duration::from_secs(crate::config::SHUTDOWN_JOIN_SECS), transport)
        .await
        .is_err()
    {
        warn!("Market feed did not stop in time");
    }
    info!("Recorder stopped");
    Ok(())
}
