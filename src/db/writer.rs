use tokio::sync::mpsc;
use tracing::{error, info};

use crate::db::models::TradeRow;
use crate::error::Result;
use crate::types::Trade;

/// Where a stored trade came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSource {
    Chain,
    Rest,
}

impl TradeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeSource::Chain => "chain",
            TradeSource::Rest => "rest",
        }
    }
}

const INSERT_TRADE: &str = r#"
    INSERT OR IGNORE INTO trades (
        dedupe_key, market_slug, window_start_ts, condition_id, event_id,
        trade_timestamp, trade_utc, price, size, notional, side, outcome,
        asset, proxy_wallet, transaction_hash, timestamp_ms, server_received_ms, source
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_trade<'q>(q: SqliteQuery<'q>, t: &'q Trade, source: TradeSource) -> SqliteQuery<'q> {
    q.bind(&t.dedupe_key)
        .bind(&t.market_slug)
        .bind(t.window_start_ts as i64)
        .bind(&t.condition_id)
        .bind(&t.event_id)
        .bind(t.trade_timestamp as i64)
        .bind(&t.trade_utc)
        .bind(t.price)
        .bind(t.size)
        .bind(t.notional)
        .bind(t.side.as_str())
        .bind(&t.outcome)
        .bind(&t.asset)
        .bind(&t.proxy_wallet)
        .bind(&t.transaction_hash)
        .bind(t.timestamp_ms.map(|v| v as i64))
        .bind(t.server_received_ms.map(|v| v as i64))
        .bind(source.as_str())
}

/// SQLite trade store. Uniqueness on `dedupe_key` makes every insert idempotent.
#[derive(Clone)]
pub struct TradeDb {
    pool: sqlx::SqlitePool,
}

impl TradeDb {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = sqlx::SqlitePool::connect(&format!("sqlite:{path}?mode=rwc")).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: sqlx::SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// `true` when the row was new.
    pub async fn insert_trade(&self, t: &Trade, source: TradeSource) -> Result<bool> {
        let result = bind_trade(sqlx::query(INSERT_TRADE), t, source)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Inserts in one transaction; returns how many rows were new.
    pub async fn insert_trades(&self, trades: &[Trade], source: TradeSource) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for t in trades {
            let result = bind_trade(sqlx::query(INSERT_TRADE), t, source)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT id, dedupe_key, market_slug, condition_id, trade_timestamp, price, size,
                   notional, side, outcome, asset, transaction_hash, timestamp_ms, source
            FROM trades
            ORDER BY trade_timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Drains streamed trades into SQLite as a background task, off the emit path.
pub struct DbWriter {
    db: TradeDb,
    trade_rx: mpsc::Receiver<Trade>,
}

impl DbWriter {
    pub fn new(db: TradeDb, trade_rx: mpsc::Receiver<Trade>) -> Self {
        Self { db, trade_rx }
    }

    pub async fn run(mut self) {
        let mut written = 0u64;
        while let Some(trade) = self.trade_rx.recv().await {
            match self.db.insert_trade(&trade, TradeSource::Chain).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => error!("DB write error: {e}"),
            }
        }
        info!(written, "DB writer drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_db() -> TradeDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        TradeDb::from_pool(pool).await.unwrap()
    }

    fn trade(key: &str, ts: u64) -> Trade {
        Trade {
            market_slug: "btc-updown-5m-1771211700".into(),
            window_start_ts: 1771211700,
            condition_id: "0xcond".into(),
            event_id: "ev".into(),
            trade_timestamp: ts,
            trade_utc: String::new(),
            price: None,
            size: 2.0,
            notional: None,
            side: Side::Buy,
            outcome: "Down".into(),
            asset: "78".into(),
            proxy_wallet: "0xm".into(),
            transaction_hash: "0xtx".into(),
            dedupe_key: key.into(),
            timestamp_ms: Some(ts * 1000),
            server_received_ms: None,
            trade_time_ms: None,
        }
    }

    #[tokio::test]
    async fn duplicate_dedupe_keys_are_ignored() {
        let db = memory_db().await;
        assert!(db.insert_trade(&trade("k1", 10), TradeSource::Chain).await.unwrap());
        assert!(!db.insert_trade(&trade("k1", 10), TradeSource::Chain).await.unwrap());

        let n = db
            .insert_trades(&[trade("k1", 10), trade("k2", 11), trade("k3", 12)], TradeSource::Rest)
            .await
            .unwrap();
        assert_eq!(n, 2);

        let rows = db.recent_trades(10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].dedupe_key, "k3");
        assert_eq!(rows[2].source, "chain");
        assert_eq!(rows[0].price, None);
    }

    #[tokio::test]
    async fn writer_drains_channel() {
        let db = memory_db().await;
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(DbWriter::new(db.clone(), rx).run());
        tx.send(trade("a", 1)).await.unwrap();
        tx.send(trade("a", 1)).await.unwrap();
        tx.send(trade("b", 2)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(db.recent_trades(10).await.unwrap().len(), 2);
    }
}
