use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Strings, numbers and nulls all relay as text; the recorder never reinterprets values.
fn verbatim<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// A single price level in a book snapshot.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BookLevel {
    #[serde(default, deserialize_with = "verbatim")]
    pub price: String,
    #[serde(default, deserialize_with = "verbatim")]
    pub size: String,
}

/// One entry inside the `price_changes` array.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PriceChangeEntry {
    #[serde(default, deserialize_with = "verbatim")]
    pub asset_id: String,
    #[serde(default, deserialize_with = "verbatim")]
    pub price: String,
    #[serde(default, deserialize_with = "verbatim")]
    pub size: String,
    /// "SELL" = ask side, "BUY" = bid side.
    #[serde(default, deserialize_with = "verbatim")]
    pub side: String,
    #[serde(default, deserialize_with = "verbatim")]
    pub best_bid: String,
    #[serde(default, deserialize_with = "verbatim")]
    pub best_ask: String,
}

/// Raw shape covering all market-channel messages.
/// Fields default because different event types carry different subsets.
#[derive(Debug, Deserialize)]
struct RawFeedMsg {
    #[serde(default, deserialize_with = "verbatim")]
    event_type: String,
    #[serde(default, deserialize_with = "verbatim")]
    asset_id: String,
    /// Condition id.
    #[serde(default, deserialize_with = "verbatim")]
    market: String,
    /// Server time in ms.
    #[serde(default, deserialize_with = "verbatim")]
    timestamp: String,
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
    #[serde(default)]
    price_changes: Vec<PriceChangeEntry>,
    #[serde(default, deserialize_with = "verbatim")]
    side: String,
    #[serde(default, deserialize_with = "verbatim")]
    price: String,
    #[serde(default, deserialize_with = "verbatim")]
    size: String,
    #[serde(default, deserialize_with = "verbatim")]
    fee_rate_bps: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Full order book snapshot for one token.
    Book {
        asset_id: String,
        condition_id: String,
        server_ts_ms: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    /// Level changes, possibly spanning several tokens of one market.
    PriceChange {
        condition_id: String,
        server_ts_ms: String,
        changes: Vec<PriceChangeEntry>,
    },
    LastTrade {
        asset_id: String,
        condition_id: String,
        server_ts_ms: String,
        side: String,
        price: String,
        size: String,
        fee_rate_bps: String,
    },
}

/// Classifies one market-channel event object. Unknown event types yield `None`.
pub fn parse_feed_event(event: &Value) -> Option<FeedEvent> {
    let msg = RawFeedMsg::deserialize(event).ok()?;
    match msg.event_type.as_str() {
        "book" if !msg.asset_id.is_empty() => Some(FeedEvent::Book {
            asset_id: msg.asset_id,
            condition_id: msg.market,
            server_ts_ms: msg.timestamp,
            bids: msg.bids,
            asks: msg.asks,
        }),
        "price_change" if !msg.price_changes.is_empty() => Some(FeedEvent::PriceChange {
            condition_id: msg.market,
            server_ts_ms: msg.timestamp,
            changes: msg.price_changes,
        }),
        "last_trade_price" if !msg.asset_id.is_empty() => Some(FeedEvent::LastTrade {
            asset_id: msg.asset_id,
            condition_id: msg.market,
            server_ts_ms: msg.timestamp,
            side: msg.side,
            price: msg.price,
            size: msg.size,
            fee_rate_bps: msg.fee_rate_bps,
        }),
        _ => None,
    }
}
