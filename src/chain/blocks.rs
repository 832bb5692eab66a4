use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::chain::rpc::ChainRpc;
use crate::error::Result;

/// Maps wall-clock time to block boundaries by bisection over `[1, latest]`.
///
/// Block timestamps are assumed non-decreasing in block number. Every lookup goes
/// through one shared `block -> timestamp` memo, so resolving both ends of a window
/// and then timestamping the scanned logs reuses earlier calls.
pub struct BlockTimeResolver {
    rpc: Arc<dyn ChainRpc>,
    cache: DashMap<u64, u64>,
}

impl BlockTimeResolver {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self { rpc, cache: DashMap::new() }
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    pub async fn timestamp(&self, block_number: u64) -> Result<u64> {
        if let Some(ts) = self.cache.get(&block_number) {
            return Ok(*ts);
        }
        let ts = self.rpc.block_timestamp(block_number).await?;
        self.cache.insert(block_number, ts);
        Ok(ts)
    }

    /// Smallest `b` in `[1, latest]` with `timestamp(b) >= target`.
    /// Returns `latest` when no block qualifies.
    pub async fn first_block_with_ts_ge(&self, target: u64, latest: u64) -> Result<u64> {
        let (mut lo, mut hi) = (1u64, latest.max(1));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.timestamp(mid).await? < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        debug!(target, block = lo, lookups = self.cache.len(), "first block with ts >= target");
        Ok(lo)
    }

    /// Largest `b` in `[1, latest]` with `timestamp(b) <= target`.
    /// Returns 1 when no block qualifies.
    pub async fn last_block_with_ts_le(&self, target: u64, latest: u64) -> Result<u64> {
        let (mut lo, mut hi) = (1u64, latest.max(1));
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.timestamp(mid).await? > target {
                hi = mid - 1;
            } else {
                lo = mid;
            }
        }
        debug!(target, block = lo, lookups = self.cache.len(), "last block with ts <= target");
        Ok(lo)
    }

    #[cfg(test)]
    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }
}
