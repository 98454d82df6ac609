//! Parser module for odds feed payloads
//!
//! Handles deserialization of MESSAGE bodies (deltas) and REST snapshots. Both share the
//! same market object shape:
//!
//! ```json
//! {"gid": 47414947, "sid": "NFL", "lid": 3, "seq": 6, "ts": 1700000000000, "lvg": 2,
//!  "mkt": {"s": [{"h": -110, "hp": -1.5, "v": -110, "vp": 1.5}]}}
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{FeedError, Result};
use crate::market::{Delta, MarketIds, MarketRecord, MarketSnapshot, OutcomeQuote};

pub const SPREAD_HOME: &str = "spread-home";
pub const SPREAD_AWAY: &str = "spread-away";
pub const MONEYLINE_HOME: &str = "home";
pub const MONEYLINE_AWAY: &str = "away";
pub const TOTAL_OVER: &str = "over";
pub const TOTAL_UNDER: &str = "under";

/// `lvg` value marking an in-play game
const LIVE_GAME: u8 = 2;

/// One market object as delivered by the feed
#[derive(Debug, Clone, Deserialize)]
pub struct MarketMessage {
    /// Market UUID, when the feed provides one
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub uuid: Option<String>,

    /// Game id
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub gid: Option<String>,

    /// Sport code
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub sid: Option<String>,

    /// League id
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub lid: Option<String>,

    /// Per-market sequence number
    #[serde(default, alias = "sq")]
    pub seq: Option<u64>,

    /// Source timestamp (epoch milliseconds)
    #[serde(default)]
    pub ts: Option<i64>,

    /// Live game marker
    #[serde(default)]
    pub lvg: Option<u8>,

    /// Market block
    #[serde(default)]
    pub mkt: Option<MarketBlock>,
}

/// Market lines keyed by type
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketBlock {
    /// Point spread
    #[serde(default)]
    pub s: Vec<MarketLine>,

    /// Moneyline
    #[serde(default)]
    pub m: Vec<MarketLine>,

    /// Totals (over/under)
    #[serde(default)]
    pub t: Vec<MarketLine>,
}

/// Home/visitor prices and points of one line
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketLine {
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub h: Option<Decimal>,

    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub hp: Option<Decimal>,

    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub v: Option<Decimal>,

    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub vp: Option<Decimal>,
}

/// Snapshot response: either a bare array or `{"markets": [...]}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SnapshotResponse {
    Wrapped { markets: Vec<MarketMessage> },
    Bare(Vec<MarketMessage>),
}

impl MarketMessage {
    /// Market identifier: the UUID when present, otherwise the game id
    pub fn market_id(&self) -> Option<&str> {
        self.uuid.as_deref().or(self.gid.as_deref())
    }

    pub fn ids(&self) -> MarketIds {
        MarketIds {
            sport: self.sid.clone(),
            league: self.lid.clone(),
            game: self.gid.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.lvg == Some(LIVE_GAME)
    }

    /// Flatten the first line of each market type into outcome quotes
    pub fn outcomes(&self) -> BTreeMap<String, OutcomeQuote> {
        let mut outcomes = BTreeMap::new();
        let Some(mkt) = &self.mkt else {
            return outcomes;
        };

        if let Some(line) = mkt.s.first() {
            insert_quote(&mut outcomes, SPREAD_HOME, line.h, line.hp);
            insert_quote(&mut outcomes, SPREAD_AWAY, line.v, line.vp);
        }
        if let Some(line) = mkt.m.first() {
            insert_quote(&mut outcomes, MONEYLINE_HOME, line.h, None);
            insert_quote(&mut outcomes, MONEYLINE_AWAY, line.v, None);
        }
        if let Some(line) = mkt.t.first() {
            insert_quote(&mut outcomes, TOTAL_OVER, line.h, line.hp);
            insert_quote(&mut outcomes, TOTAL_UNDER, line.v, line.vp);
        }
        outcomes
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.ts
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now)
    }

    /// Convert to a delta; `Ok(None)` for status updates without a market block
    pub fn into_delta(self) -> Result<Option<Delta>> {
        if self.mkt.is_none() {
            return Ok(None);
        }
        let market_id = self
            .market_id()
            .ok_or_else(|| FeedError::ParseError("market update without gid/uuid".into()))?
            .to_string();
        let sequence = self.seq.ok_or_else(|| {
            FeedError::ParseError(format!("market update {market_id} without sequence"))
        })?;

        Ok(Some(Delta {
            outcomes: self.outcomes(),
            ids: self.ids(),
            timestamp: self.timestamp(),
            live: self.is_live(),
            market_id,
            sequence,
        }))
    }

    /// Convert to a snapshot record; a missing sequence starts the market at 0
    pub fn into_record(self) -> Result<MarketRecord> {
        let id = self
            .market_id()
            .ok_or_else(|| FeedError::ParseError("snapshot market without gid/uuid".into()))?
            .to_string();

        Ok(MarketRecord {
            outcomes: self.outcomes(),
            ids: self.ids(),
            sequence: self.seq.unwrap_or(0),
            updated_at: self.timestamp(),
            id,
        })
    }
}

/// Deltas from one MESSAGE body plus the objects that could not be used
#[derive(Debug, Default)]
pub struct ParsedBody {
    pub deltas: Vec<Delta>,
    pub rejected: Vec<FeedError>,
}

/// Parse a MESSAGE body into deltas (object or array of objects)
///
/// Objects are converted one at a time; a bad object lands in `rejected` and does not
/// affect its neighbours. Only a body that is not JSON, or not an object/array, is an error.
pub fn parse_message_body(body: &str) -> Result<ParsedBody> {
    let clean = body.trim_end_matches(['\0', '\n', '\r', ' ']);
    if clean.is_empty() {
        return Ok(ParsedBody::default());
    }

    let items = match serde_json::from_str::<Value>(clean)? {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(FeedError::ParseError(format!(
                "expected object or array, got {}",
                json_kind(&other)
            )));
        }
    };

    let mut parsed = ParsedBody {
        deltas: Vec::with_capacity(items.len()),
        rejected: Vec::new(),
    };
    for item in items {
        let delta = serde_json::from_value::<MarketMessage>(item)
            .map_err(FeedError::from)
            .and_then(MarketMessage::into_delta);
        match delta {
            Ok(Some(delta)) => parsed.deltas.push(delta),
            Ok(None) => {}
            Err(e) => parsed.rejected.push(e),
        }
    }
    Ok(parsed)
}

/// Parse a REST snapshot response
pub fn parse_snapshot(body: &str) -> Result<MarketSnapshot> {
    let response: SnapshotResponse = serde_json::from_str(body)?;
    let messages = match response {
        SnapshotResponse::Wrapped { markets } => markets,
        SnapshotResponse::Bare(markets) => markets,
    };

    let records = messages
        .into_iter()
        .map(MarketMessage::into_record)
        .collect::<Result<Vec<_>>>()?;
    Ok(MarketSnapshot::from_records(records))
}

fn insert_quote(
    outcomes: &mut BTreeMap<String, OutcomeQuote>,
    label: &str,
    price: Option<Decimal>,
    line: Option<Decimal>,
) {
    if let Some(price) = price {
        outcomes.insert(label.to_string(), OutcomeQuote { price, line });
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Identifiers arrive as numbers or strings; normalise to strings
pub(crate) fn deserialize_opt_id<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid identifier: {other}"
        ))),
    }
}

/// Prices arrive as numbers or strings ("-366", "+150", "1.5")
fn deserialize_opt_decimal<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Decimal::from_str(s.strip_prefix('+').unwrap_or(s))
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!("invalid price: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_spread_delta() {
        let raw = r#"[{
            "gid": 47414947,
            "sid": "NFL",
            "lid": 3,
            "seq": 12,
            "ts": 1700000000000,
            "lvg": 2,
            "mkt": {"s": [{"h": -360, "hp": 1.5, "v": 250, "vp": -1.5}]}
        }]"#;

        let deltas = parse_message_body(raw).unwrap().deltas;
        assert_eq!(deltas.len(), 1);
        let delta = &deltas[0];
        assert_eq!(delta.market_id, "47414947");
        assert_eq!(delta.ids.sport.as_deref(), Some("NFL"));
        assert_eq!(delta.ids.league.as_deref(), Some("3"));
        assert_eq!(delta.sequence, 12);
        assert!(delta.live);
        assert_eq!(
            delta.outcomes[SPREAD_HOME],
            OutcomeQuote::with_line(dec!(-360), dec!(1.5))
        );
        assert_eq!(
            delta.outcomes[SPREAD_AWAY],
            OutcomeQuote::with_line(dec!(250), dec!(-1.5))
        );
        assert_eq!(delta.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_moneyline_and_totals_object() {
        let raw = r#"{"uuid": "a1b2", "gid": "99", "sq": 3,
            "mkt": {"m": [{"h": "+150", "v": "-170"}], "t": [{"h": -105, "hp": 44.5, "v": -115, "vp": 44.5}]}}"#;

        let deltas = parse_message_body(raw).unwrap().deltas;
        let delta = &deltas[0];
        assert_eq!(delta.market_id, "a1b2");
        assert_eq!(delta.ids.game.as_deref(), Some("99"));
        assert_eq!(delta.outcomes[MONEYLINE_HOME], OutcomeQuote::new(dec!(150)));
        assert_eq!(delta.outcomes[MONEYLINE_AWAY], OutcomeQuote::new(dec!(-170)));
        assert_eq!(delta.outcomes[TOTAL_OVER].line, Some(dec!(44.5)));
        assert_eq!(delta.outcomes.len(), 4);
        assert!(!delta.live);
    }

    #[test]
    fn test_status_updates_are_skipped() {
        let raw = r#"[{"gid": 1, "lvg": 2}, {"gid": 2, "seq": 1, "mkt": {"m": [{"h": 100}]}}]"#;
        let parsed = parse_message_body(raw).unwrap();
        assert_eq!(parsed.deltas.len(), 1);
        assert_eq!(parsed.deltas[0].market_id, "2");
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn test_missing_sequence_is_rejected() {
        let raw = r#"{"gid": 1, "mkt": {"m": [{"h": 100}]}}"#;
        let parsed = parse_message_body(raw).unwrap();
        assert!(parsed.deltas.is_empty());
        assert!(matches!(parsed.rejected[..], [FeedError::ParseError(_)]));
    }

    #[test]
    fn test_bad_object_does_not_drop_its_neighbours() {
        let raw = r#"[
            {"gid": 1, "seq": 5, "mkt": {"m": [{"h": 100, "v": -120}]}},
            {"gid": 2, "mkt": {"m": [{"h": 110}]}},
            {"gid": 3, "seq": 9, "lvg": 900, "mkt": {"m": [{"h": 105}]}},
            {"gid": 4, "seq": 2, "mkt": {"t": [{"h": -110, "hp": 41.5}]}}
        ]"#;

        let parsed = parse_message_body(raw).unwrap();
        let ids: Vec<_> = parsed.deltas.iter().map(|d| d.market_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
        assert_eq!(parsed.rejected.len(), 2);
        assert!(parsed
            .rejected
            .iter()
            .all(|e| matches!(e, FeedError::ParseError(_))));
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(parse_message_body("{not json").is_err());
        assert!(parse_message_body("42").is_err());
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        let parsed = parse_message_body("\0\n").unwrap();
        assert!(parsed.deltas.is_empty());
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn test_parse_snapshot_wrapped_and_bare() {
        let wrapped = r#"{"markets": [
            {"uuid": "M1", "gid": 10, "sid": "NBA", "seq": 5, "mkt": {"m": [{"h": 100, "v": -120}]}},
            {"uuid": "M2", "gid": 11, "mkt": {"t": [{"h": -110, "hp": 210.5, "v": -110, "vp": 210.5}]}}
        ]}"#;
        let snapshot = parse_snapshot(wrapped).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.markets["M1"].sequence, 5);
        assert_eq!(snapshot.markets["M1"].outcomes["home"].price, dec!(100));
        assert_eq!(snapshot.markets["M2"].sequence, 0);

        let bare = r#"[{"gid": 10, "seq": 1, "mkt": {"m": [{"h": 100}]}}]"#;
        assert_eq!(parse_snapshot(bare).unwrap().len(), 1);
    }
}
