//! Request counters, collected when the metrics toggle is on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Stats {
    enabled: bool,
    requests: AtomicU64,
    transactions: AtomicU64,
    checkpoints: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub transactions: u64,
    pub checkpoints: u64,
}

impl Stats {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self { enabled, ..Default::default() })
    }

    pub fn record_request(&self) {
        if self.enabled {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transaction(&self) {
        if self.enabled {
            self.transactions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_checkpoint(&self) {
        if self.enabled {
            self.checkpoints.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_stats_stay_zero() {
        let stats = Stats::new(false);
        stats.record_request();
        assert_eq!(stats.snapshot().requests, 0);

        let stats = Stats::new(true);
        stats.record_request();
        stats.record_request();
        assert_eq!(stats.snapshot().requests, 2);
    }
}
