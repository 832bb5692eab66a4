mod api;
mod backfill;
mod chain;
mod config;
mod db;
mod error;
mod fetcher;
mod history;
mod normalize;
mod rate_limit;
mod recorder;
mod sink;
mod state;
mod stream;
mod timeframes;
mod types;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backfill::{backfill_market, BackfillOptions};
use crate::chain::rpc::{ChainRpc, RpcClient};
use crate::chain::scanner::ScanConfig;
use crate::config::{normalize_rpc_http_url, Config, DEFAULT_INITIAL_SPAN_BLOCKS, DEFAULT_MIN_SPAN_BLOCKS};
use crate::db::TradeDb;
use crate::error::Result;
use crate::fetcher::RestClient;

#[derive(Parser)]
#[command(name = "ingest", about = "Polymarket BTC up/down trade ingestion")]
struct Cli {
    /// Overrides OUTPUT_DIR.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream on-chain fills of every tracked market as blocks arrive.
    Stream,
    /// Strict on-chain backfill of one market's full trade history.
    Backfill {
        #[arg(long)]
        slug: String,
        /// Repeatable; defaults to RPC_URLS.
        #[arg(long = "rpc-url")]
        rpc_urls: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_INITIAL_SPAN_BLOCKS)]
        initial_span: u64,
        #[arg(long, default_value_t = DEFAULT_MIN_SPAN_BLOCKS)]
        min_span: u64,
        /// Seconds before createdAt to include.
        #[arg(long, default_value_t = 300)]
        buffer_before: u64,
        /// Seconds after closedTime/endDate to include.
        #[arg(long, default_value_t = 7200)]
        buffer_after: u64,
        #[arg(long)]
        compare_csv: Option<PathBuf>,
    },
    /// REST trade history of one market.
    History {
        #[arg(long)]
        slug: String,
    },
    /// Record order-book snapshots, level changes and last trades from the market feed.
    Record,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(dir) = cli.output_dir.clone() {
        cfg.output_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cli.command, cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

/// Flips the watch to true on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!("Signal handler failed, shutting down: {e}"),
        }
        let _ = tx.send(true);
    });
    rx
}

async fn run(command: Command, cfg: Config) -> Result<()> {
    match command {
        Command::Stream => stream::run_stream(cfg, shutdown_signal()).await,
        Command::Record => recorder::run_recorder(cfg, shutdown_signal()).await,
        Command::History { slug } => {
            let rest = RestClient::new(&cfg)?;
            let db = match &cfg.db_path {
                Some(path) => Some(TradeDb::open(path).await?),
                None => None,
            };
            history::run_history(&rest, &slug, &cfg.output_dir, db.as_ref()).await?;
            Ok(())
        }
        Command::Backfill {
            slug,
            rpc_urls,
            initial_span,
            min_span,
            buffer_before,
            buffer_after,
            compare_csv,
        } => {
            let rpc_urls: Vec<String> = if rpc_urls.is_empty() {
                cfg.rpc_urls.clone()
            } else {
                rpc_urls.iter().map(|u| normalize_rpc_http_url(u)).collect()
            };
            let rest = RestClient::new(&cfg)?;
            let raw = rest.fetch_market_by_slug(&slug).await?;

            let rpc: Arc<dyn ChainRpc> = Arc::new(RpcClient::new(
                rpc_urls.clone(),
                Duration::from_secs(cfg.request_timeout_secs),
                cfg.max_retries,
            )?);
            let opts = BackfillOptions {
                scan: ScanConfig {
                    initial_span,
                    min_span,
                },
                buffer_before_secs: buffer_before,
                buffer_after_secs: buffer_after,
                compare_csv,
                output_dir: cfg.output_dir.clone(),
                rpc_urls,
            };
            let out = backfill_market(&raw, rpc, &opts).await?;
            info!(
                rows = out.report.strict_trades.rows,
                csv = %out.trades_csv.display(),
                validation = %out.validation_json.display(),
                "Done"
            );
            Ok(())
        }
    }
}
