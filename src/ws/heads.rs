use std::time::Duration;

use serde_json::{json, Value};

use crate::chain::decoder::parse_quantity;
use crate::ws::connection::{FeedProtocol, Heartbeat};

const PING_INTERVAL_SECS: u64 = 20;

/// Chain `newHeads` subscription over JSON-RPC websocket framing.
pub struct HeadFeed;

impl FeedProtocol for HeadFeed {
    fn name(&self) -> &'static str {
        "heads"
    }

    fn connect_frames(&self, _subscribed: &[String]) -> Vec<String> {
        vec![json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        })
        .to_string()]
    }

    fn subscribe_frame(&self, _ids: &[String]) -> Option<String> {
        None
    }

    fn unsubscribe_frame(&self, _ids: &[String]) -> Option<String> {
        None
    }

    fn heartbeat(&self) -> Option<(Heartbeat, Duration)> {
        Some((Heartbeat::Ping, Duration::from_secs(PING_INTERVAL_SECS)))
    }
}

/// `(block_number, timestamp_or_zero)` from an `eth_subscription` notification.
pub fn parse_head(payload: &Value) -> Option<(u64, u64)> {
    if payload.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let result = payload.get("params")?.get("result")?;
    if !result.is_object() {
        return None;
    }
    let number = parse_quantity(result.get("number")?);
    if number == 0 {
        return None;
    }
    let timestamp = result.get("timestamp").map(parse_quantity).unwrap_or(0);
    Some((number, timestamp))
}
