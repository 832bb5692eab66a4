//! In-memory latency histogram for the real-time path.
//! Records time from head receipt to trade emit.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// Values stored in microseconds. Tracks 1us to 100s, 3 significant figures.
pub struct LatencyStats {
    inner: Mutex<Option<Histogram<u64>>>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Histogram::new_with_bounds(1, 100_000_000, 3).ok()),
        }
    }

    pub fn record_us(&self, us: u64) {
        if let Some(h) = self.inner.lock().as_mut() {
            h.saturating_record(us.max(1));
        }
    }

    pub fn record_ms(&self, ms: u64) {
        self.record_us(ms.saturating_mul(1000));
    }

    /// Return (p50_us, p95_us, p99_us). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(h) if h.len() > 0 => (
                Some(h.value_at_quantile(0.5)),
                Some(h.value_at_quantile(0.95)),
                Some(h.value_at_quantile(0.99)),
            ),
            _ => (None, None, None),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().as_ref().map(|h| h.len()).unwrap_or(0)
    }

    pub fn summary(&self) -> LatencySummary {
        let (p50, p95, p99) = self.percentiles();
        let ms = |v: Option<u64>| v.map(|us| us as f64 / 1000.0);
        LatencySummary {
            samples: self.len(),
            p50_ms: ms(p50),
            p95_ms: ms(p95),
            p99_ms: ms(p99),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let s = LatencyStats::new();
        assert_eq!(s.percentiles(), (None, None, None));
        assert_eq!(s.summary().samples, 0);
    }

    #[test]
    fn percentiles_in_ms() {
        let s = LatencyStats::new();
        for ms in 1..=100 {
            s.record_ms(ms);
        }
        let summary = s.summary();
        assert_eq!(summary.samples, 100);
        let p50 = summary.p50_ms.unwrap();
        let p99 = summary.p99_ms.unwrap();
        assert!((p50 - 50.0).abs() < 0.5, "p50 = {p50}");
        assert!((p99 - 99.0).abs() < 0.5, "p99 = {p99}");
    }
}
