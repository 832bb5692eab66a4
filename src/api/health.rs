//! Shared health state for the /health endpoint.
//! Updated by the head feed consumer and the block processor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct HealthState {
    /// True while the head subscription socket is open.
    pub head_connected: AtomicBool,
    /// Number of the most recently processed block (0 = none).
    pub last_head_block: AtomicU64,
    pub trades_emitted: AtomicU64,
    /// Blocks dropped after a processing error.
    pub blocks_failed: AtomicU64,
    pub active_markets: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub head_connected: bool,
    pub last_head_block: u64,
    pub trades_emitted: u64,
    pub blocks_failed: u64,
    pub active_markets: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head_connected(&self, v: bool) {
        self.head_connected.store(v, Ordering::Relaxed);
    }

    pub fn set_last_head_block(&self, block: u64) {
        self.last_head_block.fetch_max(block, Ordering::Relaxed);
    }

    pub fn inc_trades_emitted(&self) {
        self.trades_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocks_failed(&self) {
        self.blocks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_markets(&self, n: usize) {
        self.active_markets.store(n as u64, Ordering::Relaxed);
    }

    pub fn head_connected(&self) -> bool {
        self.head_connected.load(Ordering::Relaxed)
    }

    pub fn trades_emitted(&self) -> u64 {
        self.trades_emitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            head_connected: self.head_connected(),
            last_head_block: self.last_head_block.load(Ordering::Relaxed),
            trades_emitted: self.trades_emitted(),
            blocks_failed: self.blocks_failed.load(Ordering::Relaxed),
            active_markets: self.active_markets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_head_block_never_moves_backwards() {
        let h = HealthState::new();
        h.set_last_head_block(10);
        h.set_last_head_block(7);
        h.inc_trades_emitted();
        h.set_head_connected(true);
        let s = h.snapshot();
        assert_eq!(s.last_head_block, 10);
        assert_eq!(s.trades_emitted, 1);
        assert!(s.head_connected);
    }
}
