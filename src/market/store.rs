//! Snapshot + delta market state
//!
//! A snapshot replaces everything; deltas are applied per market only when their
//! sequence is strictly above the market's current one.

use std::collections::HashMap;

use tracing::{debug, trace};

use super::{Delta, MarketRecord, MarketSnapshot, OutcomeChange, StateChangeEvent, StoreMetrics};

/// Current state of every market in the session
#[derive(Debug, Default)]
pub struct MarketStateStore {
    markets: HashMap<String, MarketRecord>,
    metrics: StoreMetrics,
}

impl MarketStateStore {
    pub fn new(metrics: StoreMetrics) -> Self {
        Self {
            markets: HashMap::new(),
            metrics,
        }
    }

    /// Replace the whole state with a fresh snapshot
    pub fn apply_snapshot(&mut self, snapshot: MarketSnapshot) {
        self.markets = snapshot.markets;
        self.metrics.snapshots_applied.inc();
        self.metrics.markets_tracked.set(self.markets.len() as i64);
        debug!(markets = self.markets.len(), "Snapshot applied");
    }

    /// Apply a delta
    ///
    /// Returns the resulting change, or `None` when the delta was dropped (unknown market,
    /// or a sequence not above the current one).
    pub fn apply_delta(&mut self, delta: &Delta) -> Option<StateChangeEvent> {
        let Some(record) = self.markets.get_mut(&delta.market_id) else {
            self.metrics.deltas_dropped_unknown.inc();
            trace!(market = %delta.market_id, "Delta for unknown market dropped");
            return None;
        };

        if delta.sequence <= record.sequence {
            self.metrics.deltas_dropped_stale.inc();
            trace!(
                market = %delta.market_id,
                sequence = delta.sequence,
                current = record.sequence,
                "Stale delta dropped"
            );
            return None;
        }

        let mut changes = Vec::new();
        for (outcome, quote) in &delta.outcomes {
            let before = record.outcomes.insert(outcome.clone(), *quote);
            if before != Some(*quote) {
                changes.push(OutcomeChange {
                    outcome: outcome.clone(),
                    before,
                    after: *quote,
                });
            }
        }

        let previous_sequence = record.sequence;
        record.sequence = delta.sequence;
        record.updated_at = delta.timestamp;
        self.metrics.deltas_applied.inc();

        Some(StateChangeEvent {
            market_id: record.id.clone(),
            ids: record.ids.clone(),
            previous_sequence,
            sequence: delta.sequence,
            timestamp: delta.timestamp,
            changes,
        })
    }

    pub fn get(&self, market_id: &str) -> Option<&MarketRecord> {
        self.markets.get(market_id)
    }

    /// Copies of all records
    pub fn records(&self) -> Vec<MarketRecord> {
        self.markets.values().cloned().collect()
    }

    pub fn market_ids(&self) -> Vec<String> {
        self.markets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }
}
