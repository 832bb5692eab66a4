/// Row type for the `trades` table in `migrations/0001_init.sql`.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TradeRow {
    pub id: i64,
    pub dedupe_key: String,
    pub market_slug: String,
    pub condition_id: String,
    pub trade_timestamp: i64,
    pub price: Option<f64>,
    pub size: f64,
    pub notional: Option<f64>,
    pub side: String,
    pub outcome: String,
    pub asset: String,
    pub transaction_hash: String,
    pub timestamp_ms: Option<i64>,
    pub source: String,
}
