//! Market state counters

use prometheus::{IntCounter, IntGauge, Registry};

/// Counters for snapshot and delta handling
///
/// Cloning shares the underlying counters.
#[derive(Clone)]
pub struct StoreMetrics {
    pub snapshots_applied: IntCounter,
    pub deltas_applied: IntCounter,
    /// Out-of-order or duplicate deltas
    pub deltas_dropped_stale: IntCounter,
    /// Deltas for markets missing from the snapshot
    pub deltas_dropped_unknown: IntCounter,
    pub markets_tracked: IntGauge,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            snapshots_applied: counter(
                "odds_feed_snapshots_applied_total",
                "Snapshots applied to the store",
            ),
            deltas_applied: counter("odds_feed_deltas_applied_total", "Deltas applied to a market"),
            deltas_dropped_stale: counter(
                "odds_feed_deltas_dropped_stale_total",
                "Deltas dropped for a sequence not above the market's current one",
            ),
            deltas_dropped_unknown: counter(
                "odds_feed_deltas_dropped_unknown_total",
                "Deltas dropped because the market is not in the snapshot",
            ),
            markets_tracked: gauge(
                "odds_feed_markets_tracked",
                "Markets currently held in the store",
            ),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.snapshots_applied.clone()))?;
        registry.register(Box::new(self.deltas_applied.clone()))?;
        registry.register(Box::new(self.deltas_dropped_stale.clone()))?;
        registry.register(Box::new(self.deltas_dropped_unknown.clone()))?;
        registry.register(Box::new(self.markets_tracked.clone()))?;
        Ok(())
    }

    /// Total of both drop reasons
    pub fn deltas_dropped(&self) -> u64 {
        self.deltas_dropped_stale.get() + self.deltas_dropped_unknown.get()
    }
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics")
            .field("snapshots_applied", &self.snapshots_applied.get())
            .field("deltas_applied", &self.deltas_applied.get())
            .field("deltas_dropped_stale", &self.deltas_dropped_stale.get())
            .field("deltas_dropped_unknown", &self.deltas_dropped_unknown.get())
            .field("markets_tracked", &self.markets_tracked.get())
            .finish()
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// Names and help strings are static and valid, so construction cannot fail.
pub(crate) fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static metric definition")
}

pub(crate) fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("static metric definition")
}
