use std::time::Duration;

use serde_json::json;

use crate::config::{HEARTBEAT_FRAME, HEARTBEAT_INTERVAL_SECS};
use crate::ws::connection::{FeedProtocol, Heartbeat};

/// CLOB market channel: subscribe by token id, text `PING` keepalive.
pub struct ClobFeed;

impl FeedProtocol for ClobFeed {
    fn name(&self) -> &'static str {
        "clob"
    }

    fn connect_frames(&self, subscribed: &[String]) -> Vec<String> {
        if subscribed.is_empty() {
            return Vec::new();
        }
        vec![json!({
            "assets_ids": subscribed,
            "type": "market",
            "custom_feature_enabled": true,
        })
        .to_string()]
    }

    fn subscribe_frame(&self, ids: &[String]) -> Option<String> {
        Some(
            json!({
                "assets_ids": ids,
                "operation": "subscribe",
                "custom_feature_enabled": true,
            })
            .to_string(),
        )
    }

    fn unsubscribe_frame(&self, ids: &[String]) -> Option<String> {
        Some(json!({ "assets_ids": ids, "operation": "unsubscribe" }).to_string())
    }

    fn heartbeat(&self) -> Option<(Heartbeat, Duration)> {
        Some((
            Heartbeat::Text(HEARTBEAT_FRAME),
            Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn frame_shapes() {
        let ids = vec!["1".to_string()];
        assert!(ClobFeed.connect_frames(&[]).is_empty());

        let init: Value = serde_json::from_str(&ClobFeed.connect_frames(&ids)[0]).unwrap();
        assert_eq!(init["type"], "market");
        assert_eq!(init["custom_feature_enabled"], true);

        let unsub: Value = serde_json::from_str(&ClobFeed.unsubscribe_frame(&ids).unwrap()).unwrap();
        assert_eq!(unsub["operation"], "unsubscribe");
        assert_eq!(unsub["assets_ids"][0], "1");
    }
}
