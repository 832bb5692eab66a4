//! In-memory chain used by the resolver, scanner and block-processor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::chain::decoder::{address_to_topic, parse_quantity};
use crate::chain::rpc::{ChainRpc, LogFilter};
use crate::config::ORDER_FILLED_TOPIC0;
use crate::error::{AppError, Result};

pub struct FakeChain {
    timestamps: Vec<u64>,
    logs: Vec<Value>,
    max_span: Option<u64>,
    forced_too_wide: Mutex<VecDeque<bool>>,
    fatal_block: Option<u64>,
    pub block_calls: AtomicUsize,
    pub log_calls: Mutex<Vec<(u64, u64)>>,
}

impl FakeChain {
    /// `timestamps[b]` is the timestamp of block `b`; index 0 is unused.
    pub fn with_timestamps(timestamps: Vec<u64>) -> Self {
        Self {
            timestamps,
            logs: Vec::new(),
            max_span: None,
            forced_too_wide: Mutex::new(VecDeque::new()),
            fatal_block: None,
            block_calls: AtomicUsize::new(0),
            log_calls: Mutex::new(Vec::new()),
        }
    }

    /// Blocks `1..=n` at `base + 2 * b`.
    pub fn linear(n: u64, base: u64) -> Self {
        Self::with_timestamps((0..=n).map(|b| base + 2 * b).collect())
    }

    pub fn with_logs(mut self, logs: Vec<Value>) -> Self {
        self.logs = logs;
        self
    }

    /// Requests wider than `span` fail with a capacity error.
    pub fn with_max_span(mut self, span: u64) -> Self {
        self.max_span = Some(span);
        self
    }

    /// Scripted capacity errors: the n-th `eth_getLogs` call fails when `script[n]`.
    pub fn with_forced_too_wide(self, script: Vec<bool>) -> Self {
        *self.forced_too_wide.lock() = script.into();
        self
    }

    /// Any request covering `block` fails with a non-capacity error.
    pub fn with_fatal_block(mut self, block: u64) -> Self {
        self.fatal_block = Some(block);
        self
    }

    pub fn ts(&self, block: u64) -> u64 {
        self.timestamps[block as usize]
    }

    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.log_calls.lock().clone()
    }
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.timestamps.len().saturating_sub(1) as u64)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.timestamps
            .get(block_number as usize)
            .copied()
            .ok_or_else(|| AppError::Rpc {
                method: "eth_getBlockByNumber".into(),
                message: format!("unknown block {block_number}"),
            })
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Value>> {
        let from = parse_quantity(&json!(filter.from_block));
        let to = parse_quantity(&json!(filter.to_block));
        self.log_calls.lock().push((from, to));

        let forced = self.forced_too_wide.lock().pop_front().unwrap_or(false);
        let too_wide = self.max_span.is_some_and(|max| to - from + 1 > max);
        if forced || too_wide {
            return Err(AppError::Rpc {
                method: "eth_getLogs".into(),
                message: "{\"code\":-32005,\"message\":\"block range is too large\"}".into(),
            });
        }
        if self.fatal_block.is_some_and(|b| (from..=to).contains(&b)) {
            return Err(AppError::Rpc {
                method: "eth_getLogs".into(),
                message: "execution aborted".into(),
            });
        }

        let taker_topic = filter.topics.get(3).cloned().flatten();
        Ok(self
            .logs
            .iter()
            .filter(|log| {
                let b = log.get("blockNumber").map(parse_quantity).unwrap_or(0);
                (from..=to).contains(&b)
            })
            .filter(|log| match &taker_topic {
                Some(t) => log["topics"][3].as_str() == Some(t.as_str()),
                None => true,
            })
            .cloned()
            .collect())
    }
}

/// A raw `OrderFilled` log as a node would return it.
#[allow(clippy::too_many_arguments)]
pub fn fill_log(
    block: u64,
    log_index: u64,
    tx_hash: &str,
    maker: &str,
    taker: &str,
    words: [u128; 5],
) -> Value {
    let data: String = words.iter().map(|w| format!("{w:064x}")).collect();
    json!({
        "address": crate::config::CTF_EXCHANGE,
        "transactionHash": tx_hash,
        "blockNumber": format!("{block:#x}"),
        "logIndex": format!("{log_index:#x}"),
        "topics": [
            ORDER_FILLED_TOPIC0,
            format!("0x{}", "ab".repeat(32)),
            address_to_topic(maker),
            address_to_topic(taker),
        ],
        "data": format!("0x{data}"),
    })
}
