//! Resolves feed identifiers to display names

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::market::{Delta, StateChangeEvent};
use crate::parser::{
    MONEYLINE_AWAY, MONEYLINE_HOME, SPREAD_AWAY, SPREAD_HOME, TOTAL_OVER, TOTAL_UNDER,
};
use crate::reference::ReferenceData;

/// Kind of market, derived from the outcome labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarketType {
    #[serde(rename = "Point Spread")]
    PointSpread,
    #[serde(rename = "Moneyline")]
    Moneyline,
    #[serde(rename = "Total Points (Over/Under)")]
    TotalPoints,
    #[serde(rename = "Other Market")]
    Other,
    #[serde(rename = "Status Update")]
    StatusUpdate,
}

impl MarketType {
    /// Spread wins over moneyline, moneyline over totals
    pub fn infer<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut spread = false;
        let mut moneyline = false;
        let mut totals = false;
        let mut any = false;

        for label in labels {
            any = true;
            match label {
                SPREAD_HOME | SPREAD_AWAY => spread = true,
                MONEYLINE_HOME | MONEYLINE_AWAY => moneyline = true,
                TOTAL_OVER | TOTAL_UNDER => totals = true,
                _ => {}
            }
        }

        if spread {
            MarketType::PointSpread
        } else if moneyline {
            MarketType::Moneyline
        } else if totals {
            MarketType::TotalPoints
        } else if any {
            MarketType::Other
        } else {
            MarketType::StatusUpdate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::PointSpread => "Point Spread",
            MarketType::Moneyline => "Moneyline",
            MarketType::TotalPoints => "Total Points (Over/Under)",
            MarketType::Other => "Other Market",
            MarketType::StatusUpdate => "Status Update",
        }
    }
}

/// Human-readable context attached to a delta
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayNames {
    pub sport_name: Option<String>,
    pub league_name: Option<String>,
    pub game_name: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub market_type: MarketType,
    pub live: bool,
}

/// Delta plus its display names
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDelta {
    pub delta: Delta,
    pub names: DisplayNames,
}

/// Applied state change with display names, as delivered downstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedStateChangeEvent {
    #[serde(flatten)]
    pub event: StateChangeEvent,
    pub names: DisplayNames,
}

/// Looks up names in a shared, periodically refreshed reference table
#[derive(Debug, Clone, Default)]
pub struct MessageEnricher {
    reference: Arc<RwLock<ReferenceData>>,
}

impl MessageEnricher {
    pub fn new(reference: Arc<RwLock<ReferenceData>>) -> Self {
        Self { reference }
    }

    /// Shared table, for the refresh task
    pub fn reference(&self) -> Arc<RwLock<ReferenceData>> {
        self.reference.clone()
    }

    /// Attach names; unknown ids get placeholders, nothing is ever dropped
    pub fn enrich(&self, delta: Delta) -> EnrichedDelta {
        let names = self.names_for(&delta);
        EnrichedDelta { delta, names }
    }

    fn names_for(&self, delta: &Delta) -> DisplayNames {
        let reference = self.reference.read();
        let ids = &delta.ids;

        let sport_name = ids.sport.as_deref().map(|sid| {
            reference
                .sport_name(sid)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Sport {sid}"))
        });
        let league_name = ids.league.as_deref().map(|lid| {
            reference
                .league_name(lid)
                .map(str::to_string)
                .unwrap_or_else(|| format!("League {lid}"))
        });

        let game = ids.game.as_deref().map(|gid| (gid, reference.game(gid)));
        let (game_name, home_team, away_team, game_live) = match game {
            Some((_, Some(info))) => (
                Some(format!("{} @ {}", info.away_team, info.home_team)),
                Some(info.home_team.clone()),
                Some(info.away_team.clone()),
                info.live,
            ),
            Some((gid, None)) => (Some(format!("Game #{gid}")), None, None, false),
            None => (None, None, None, false),
        };

        DisplayNames {
            sport_name,
            league_name,
            game_name,
            home_team,
            away_team,
            market_type: MarketType::infer(delta.outcomes.keys().map(String::as_str)),
            live: delta.live || game_live,
        }
    }
}
