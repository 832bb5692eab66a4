use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::api::routes::{self, ApiState};
use crate::api::{HealthState, LatencyStats};
use crate::chain::decoder::decode_order_filled;
use crate::chain::rpc::{ChainRpc, LogFilter, RpcClient};
use crate::config::{
    Config, BROADCAST_CAPACITY, CHANNEL_CAPACITY, EXCHANGE_ADDRESSES, HEAD_QUEUE_POLL_MS,
    ORDER_FILLED_TOPIC0, PROCESSED_BLOCK_LIMIT, SEEN_LOG_UID_LIMIT, SHUTDOWN_JOIN_SECS,
};
use crate::db::{DbWriter, TradeDb};
use crate::error::Result;
use crate::fetcher::RestClient;
use crate::normalize::{chain_trade, classify};
use crate::sink::CsvSink;
use crate::state::{BoundedSet, MarketTracker};
use crate::timeframes::file_suffix;
use crate::types::{DecodedLog, HeadEvent, Trade};
use crate::ws::heads::{parse_head, HeadFeed};
use crate::ws::{TransportEvent, TransportManager};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn stream_csv_path(output_dir: &Path, cfg: &Config) -> PathBuf {
    output_dir.join(format!("trades_btc_up_or_down_{}.csv", file_suffix(&cfg.timeframes)))
}

/// Everything an emitted trade is handed to.
pub struct TradeFanout {
    pub sink: Arc<CsvSink<Trade>>,
    pub broadcast: broadcast::Sender<String>,
    pub db: Option<mpsc::Sender<Trade>>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
}

impl TradeFanout {
    fn emit(&self, trade: &Trade, received_ms: u64) -> Result<()> {
        self.sink.append(trade)?;

        // No subscribers is not an error.
        let payload = serde_json::to_string(trade)?;
        let _ = self.broadcast.send(payload);

        if let Some(db) = &self.db {
            if let Err(e) = db.try_send(trade.clone()) {
                warn!(dedupe_key = %trade.dedupe_key, "DB queue full, trade not stored: {e}");
            }
        }

        self.health.inc_trades_emitted();
        self.latency.record_ms(now_ms().saturating_sub(received_ms));
        Ok(())
    }
}

/// Serial consumer of the head queue. Owns both dedup windows, so no lock is needed.
pub struct BlockProcessor {
    rpc: Arc<dyn ChainRpc>,
    tracker: Arc<MarketTracker>,
    fanout: TradeFanout,
    processed_blocks: BoundedSet<u64>,
    seen_log_uids: BoundedSet<String>,
}

impl BlockProcessor {
    pub fn new(rpc: Arc<dyn ChainRpc>, tracker: Arc<MarketTracker>, fanout: TradeFanout) -> Self {
        Self {
            rpc,
            tracker,
            fanout,
            processed_blocks: BoundedSet::new(PROCESSED_BLOCK_LIMIT),
            seen_log_uids: BoundedSet::new(SEEN_LOG_UID_LIMIT),
        }
    }

    /// Fetches, decodes and emits the tracked fills of one head, returning what went out.
    /// A block already seen is skipped without any RPC call.
    pub async fn process_head(&mut self, head: HeadEvent) -> Result<Vec<Trade>> {
        if !self.processed_blocks.insert(head.block_number) {
            return Ok(Vec::new());
        }

        let mut block_ts = head.block_timestamp;
        if block_ts == 0 {
            block_ts = self.rpc.block_timestamp(head.block_number).await?;
            if block_ts == 0 {
                warn!(block = head.block_number, "Head without a timestamp; skipping block");
                return Ok(Vec::new());
            }
        }

        let filter = LogFilter::new(
            EXCHANGE_ADDRESSES,
            head.block_number,
            head.block_number,
            vec![Some(ORDER_FILLED_TOPIC0.to_string())],
        );
        let raw_logs = self.rpc.get_logs(&filter).await?;

        let mut logs: Vec<DecodedLog> = raw_logs
            .iter()
            .filter_map(decode_order_filled)
            .filter(|log| EXCHANGE_ADDRESSES.contains(&log.address.as_str()))
            .collect();
        logs.sort_by_key(|log| log.log_index);

        let mut emitted = Vec::new();
        for log in &logs {
            let Some(leg) = classify(log, |token| self.tracker.is_tracked(token)) else {
                continue;
            };
            // The market may have expired between classify and resolve.
            let Some((market, _outcome)) = self.tracker.resolve_token(&leg.token_id) else {
                continue;
            };
            let Some(trade) = chain_trade(log, &leg, &market, block_ts, Some(head.received_ms)) else {
                continue;
            };
            if !self.seen_log_uids.insert(log.log_uid()) {
                continue;
            }
            self.fanout.emit(&trade, head.received_ms)?;
            emitted.push(trade);
        }

        self.fanout.health.set_last_head_block(head.block_number);
        if !emitted.is_empty() {
            info!(
                block = head.block_number,
                logs = raw_logs.len(),
                trades = emitted.len(),
                "Block processed"
            );
        } else {
            debug!(block = head.block_number, logs = raw_logs.len(), "Block processed");
        }
        Ok(emitted)
    }

    /// Drains the head queue until shutdown. A failed block is logged and dropped.
    pub async fn run(mut self, mut heads: mpsc::Receiver<HeadEvent>, shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(HEAD_QUEUE_POLL_MS);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match timeout(poll, heads.recv()).await {
                Ok(Some(head)) => {
                    if let Err(e) = self.process_head(head).await {
                        self.fanout.health.inc_blocks_failed();
                        error!(block = head.block_number, "Block processing failed, dropped: {e}");
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        if let Err(e) = self.fanout.sink.flush() {
            error!("Trade sink flush failed: {e}");
        }
        info!("Block processor stopped");
    }
}

/// Relays head notifications into the processor queue. Only enqueues; never blocks on RPC.
async fn consume_heads(
    mut events: mpsc::Receiver<TransportEvent>,
    head_tx: mpsc::Sender<HeadEvent>,
    health: Arc<HealthState>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                health.set_head_connected(true);
                info!("Head feed connected");
            }
            TransportEvent::Disconnected => {
                health.set_head_connected(false);
                warn!("Head feed disconnected");
            }
            TransportEvent::Message(payload) => {
                let Some((block_number, block_timestamp)) = parse_head(&payload) else {
                    continue;
                };
                let head = HeadEvent {
                    block_number,
                    block_timestamp,
                    received_ms: now_ms(),
                };
                if head_tx.send(head).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Periodic discovery so new windows start streaming and finished ones drop out.
async fn discovery_loop(
    tracker: Arc<MarketTracker>,
    health: Arc<HealthState>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (added, expired) = tracker.poll_once().await;
                for m in &added {
                    info!(market = %m.slug, "Market added");
                }
                for m in &expired {
                    info!(market = %m.slug, "Market expired");
                }
                health.set_active_markets(tracker.active_count());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// `stream`: tracker + head feed + block processor + broadcast server until shutdown.
pub async fn run_stream(cfg: Config, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let rpc: Arc<dyn ChainRpc> = Arc::new(RpcClient::new(
        cfg.rpc_urls.clone(),
        Duration::from_secs(cfg.request_timeout_secs),
        cfg.max_retries,
    )?);
    let rest = Arc::new(RestClient::new(&cfg)?);
    let tracker = Arc::new(MarketTracker::new(rest, cfg.timeframes.clone(), cfg.grace_period_secs));

    let (added, _) = tracker.poll_once().await;
    info!(markets = added.len(), timeframes = %file_suffix(&cfg.timeframes), "Initial discovery complete");

    let health = Arc::new(HealthState::new());
    health.set_active_markets(tracker.active_count());
    let latency = Arc::new(LatencyStats::new());

    let csv_path = stream_csv_path(&cfg.output_dir, &cfg);
    let sink = Arc::new(CsvSink::<Trade>::open(&csv_path)?);
    info!(path = %csv_path.display(), "Streaming trades to CSV");

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (db, db_tx) = match &cfg.db_path {
        Some(path) => {
            let db = TradeDb::open(path).await?;
            info!("Database ready at {path}");
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            tasks.push(tokio::spawn(DbWriter::new(db.clone(), rx).run()));
            (Some(db), Some(tx))
        }
        None => (None, None),
    };

    let (trades_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let api_state = ApiState {
        health: Arc::clone(&health),
        latency: Arc::clone(&latency),
        trades_tx: trades_tx.clone(),
        db,
    };
    let addr = cfg.broadcast_addr.clone();
    let api_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = routes::serve(&addr, api_state, api_shutdown).await {
            error!("Broadcast server error: {e}");
        }
    }));

    let (head_manager, head_handle) =
        TransportManager::new(cfg.rpc_ws_url.clone(), HeadFeed, shutdown.clone(), CHANNEL_CAPACITY);
    tasks.push(tokio::spawn(head_manager.run()));

    let (head_tx, head_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let commands = head_handle.commands;
    let consumer_health = Arc::clone(&health);
    tasks.push(tokio::spawn(async move {
        // Holding the command sender keeps the transport alive.
        let _commands = commands;
        consume_heads(head_handle.events, head_tx, consumer_health).await;
    }));

    let fanout = TradeFanout {
        sink,
        broadcast: trades_tx,
        db: db_tx,
        health: Arc::clone(&health),
        latency,
    };
    let processor = BlockProcessor::new(rpc, Arc::clone(&tracker), fanout);
    tasks.push(tokio::spawn(processor.run(head_rx, shutdown.clone())));

    tasks.push(tokio::spawn(discovery_loop(
        tracker,
        health,
        Duration::from_secs(cfg.market_poll_interval_secs.max(1)),
        shutdown.clone(),
    )));

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("Shutdown requested; joining tasks");
    join_with_timeout(tasks, Duration::from_secs(SHUTDOWN_JOIN_SECS)).await;
    Ok(())
}

/// Joins every task within `limit`; stragglers are aborted.
pub async fn join_with_timeout(tasks: Vec<JoinHandle<()>>, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    for mut task in tasks {
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task ended abnormally: {e}"),
            Err(_) => {
                warn!("Task did not stop in time; aborting");
                task.abort();
            }
        }
    }
}
