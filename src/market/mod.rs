//! Market state module
//!
//! Maintains current odds per market from a REST snapshot plus sequenced deltas.

pub(crate) mod metrics;
mod store;

pub use metrics::StoreMetrics;
pub use store::MarketStateStore;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price of one outcome, with its line (points) for spread and totals markets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeQuote {
    pub price: Decimal,
    pub line: Option<Decimal>,
}

impl OutcomeQuote {
    pub fn new(price: Decimal) -> Self {
        Self { price, line: None }
    }

    pub fn with_line(price: Decimal, line: Decimal) -> Self {
        Self {
            price,
            line: Some(line),
        }
    }
}

/// Opaque sport/league/game identifiers as delivered by the feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketIds {
    pub sport: Option<String>,
    pub league: Option<String>,
    pub game: Option<String>,
}

/// Current state of a single market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: String,
    pub ids: MarketIds,
    /// Outcome label (e.g. "home", "spread-away", "over") to quote
    pub outcomes: BTreeMap<String, OutcomeQuote>,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

/// Incremental update to one market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub market_id: String,
    pub ids: MarketIds,
    /// Only these outcomes are overwritten
    pub outcomes: BTreeMap<String, OutcomeQuote>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub live: bool,
}

/// Full point-in-time market state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    pub markets: HashMap<String, MarketRecord>,
}

impl MarketSnapshot {
    /// Build from records; duplicate ids keep the highest sequence
    pub fn from_records(records: impl IntoIterator<Item = MarketRecord>) -> Self {
        let mut markets: HashMap<String, MarketRecord> = HashMap::new();
        for record in records {
            match markets.get(&record.id) {
                Some(existing) if existing.sequence >= record.sequence => {}
                _ => {
                    markets.insert(record.id.clone(), record);
                }
            }
        }
        Self { markets }
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

/// Before/after of one outcome touched by an applied delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeChange {
    pub outcome: String,
    pub before: Option<OutcomeQuote>,
    pub after: OutcomeQuote,
}

/// Emitted for every delta that was applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub market_id: String,
    pub ids: MarketIds,
    pub previous_sequence: u64,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<OutcomeChange>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(id: &str, sequence: u64) -> MarketRecord {
        MarketRecord {
            id: id.to_string(),
            ids: MarketIds::default(),
            outcomes: BTreeMap::from([("home".to_string(), OutcomeQuote::new(dec!(100)))]),
            sequence,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_keeps_highest_sequence() {
        let snapshot =
            MarketSnapshot::from_records(vec![record("M1", 7), record("M1", 3), record("M2", 1)]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.markets["M1"].sequence, 7);
    }
}
