//! Reference data: sport, league and game names
//!
//! Loaded from the bookmaker gateway (`GetRoutingInfo` for sports and leagues,
//! `GetDashboardSchedule` for games) and refreshed periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::parser::deserialize_opt_id;

/// Teams and live flag of one game
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub home_team: String,
    pub away_team: String,
    pub live: bool,
}

/// Id -> name lookup tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceData {
    pub sports: HashMap<String, String>,
    pub leagues: HashMap<String, String>,
    pub games: HashMap<String, GameInfo>,
}

impl ReferenceData {
    pub fn sport_name(&self, id: &str) -> Option<&str> {
        self.sports.get(id).map(String::as_str)
    }

    pub fn league_name(&self, id: &str) -> Option<&str> {
        self.leagues.get(id).map(String::as_str)
    }

    pub fn game(&self, id: &str) -> Option<&GameInfo> {
        self.games.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.sports.is_empty() && self.leagues.is_empty() && self.games.is_empty()
    }

    /// Add sports and leagues from a `GetRoutingInfo` response
    pub fn merge_routing_info(&mut self, body: &str) -> Result<()> {
        let response: RoutingInfoResponse = serde_json::from_str(body)?;
        if !response.valid {
            return Err(FeedError::ReferenceData("GetRoutingInfo returned valid=false".into()));
        }

        for sport in response.routed_sports {
            let Some(sport_id) = sport.sport_id else {
                continue;
            };
            let name = sport
                .sport_desc
                .or(sport.sport_desc_en)
                .unwrap_or_else(|| "Unknown Sport".to_string());
            self.sports.insert(sport_id, name);

            for league in sport.routed_leagues {
                let Some(league_id) = league.league_id else {
                    continue;
                };
                let name = league
                    .league_desc
                    .or(league.league_desc_en)
                    .unwrap_or_else(|| "Unknown League".to_string());
                self.leagues.insert(league_id, name);
            }
        }
        Ok(())
    }

    /// Add games (plus any sports/leagues not already known) from a `GetDashboardSchedule` response
    pub fn merge_schedule(&mut self, body: &str) -> Result<()> {
        let response: ScheduleResponse = serde_json::from_str(body)?;
        if !response.valid {
            return Err(FeedError::ReferenceData(
                "GetDashboardSchedule returned valid=false".into(),
            ));
        }

        for category in response.schedule.data.categories {
            if let Some(sport_id) = category.id_sport {
                let name = category
                    .category_name
                    .unwrap_or_else(|| "Unknown Sport".to_string());
                self.sports.entry(sport_id).or_insert(name);
            }

            for league in category.leagues.league {
                if let Some(league_id) = league.id_league {
                    let name = league
                        .description
                        .unwrap_or_else(|| "Unknown League".to_string());
                    self.leagues.entry(league_id).or_insert(name);
                }

                for game in league.date_group.into_iter().flat_map(|group| group.game) {
                    let Some(game_id) = game.idgm else {
                        continue;
                    };
                    self.games.insert(
                        game_id,
                        GameInfo {
                            home_team: game.htm.unwrap_or_else(|| "Home Team".to_string()),
                            away_team: game.vtm.unwrap_or_else(|| "Away Team".to_string()),
                            live: game.live_game,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingInfoResponse {
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    routed_sports: Vec<RoutedSport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutedSport {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    sport_id: Option<String>,
    #[serde(default)]
    sport_desc: Option<String>,
    #[serde(default)]
    sport_desc_en: Option<String>,
    #[serde(default)]
    routed_leagues: Vec<RoutedLeague>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutedLeague {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    league_id: Option<String>,
    #[serde(default)]
    league_desc: Option<String>,
    #[serde(default)]
    league_desc_en: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    #[serde(default)]
    valid: bool,
    #[serde(rename = "Schedule", default)]
    schedule: Schedule,
}

#[derive(Debug, Default, Deserialize)]
struct Schedule {
    #[serde(rename = "Data", default)]
    data: ScheduleData,
}

#[derive(Debug, Default, Deserialize)]
struct ScheduleData {
    #[serde(rename = "Categories", default)]
    categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
struct Category {
    #[serde(rename = "IdSport", default, deserialize_with = "deserialize_opt_id")]
    id_sport: Option<String>,
    #[serde(rename = "CategoryName", alias = "CategoryNameEn", default)]
    category_name: Option<String>,
    #[serde(rename = "Leagues", default)]
    leagues: Leagues,
}

#[derive(Debug, Default, Deserialize)]
struct Leagues {
    #[serde(rename = "League", default)]
    league: Vec<League>,
}

#[derive(Debug, Deserialize)]
struct League {
    #[serde(rename = "IdLeague", default, deserialize_with = "deserialize_opt_id")]
    id_league: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
    #[serde(rename = "dateGroup", default)]
    date_group: Vec<DateGroup>,
}

#[derive(Debug, Deserialize)]
struct DateGroup {
    #[serde(default)]
    game: Vec<ScheduledGame>,
}

#[derive(Debug, Deserialize)]
struct ScheduledGame {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    idgm: Option<String>,
    #[serde(default)]
    htm: Option<String>,
    #[serde(default)]
    vtm: Option<String>,
    #[serde(rename = "LiveGame", default, deserialize_with = "deserialize_flag")]
    live_game: bool,
}

/// Flags arrive as booleans, 0/1 or "true"/"false"
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "y"),
        _ => false,
    })
}

/// Source of reference tables
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn load(&self) -> Result<ReferenceData>;
}

/// Loads reference data from the bookmaker gateway over HTTP
pub struct HttpReferenceSource {
    client: reqwest::Client,
    base_url: String,
    cookie: String,
}

impl HttpReferenceSource {
    pub fn new(
        base_url: &str,
        cookie_name: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::ReferenceData(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookie: format!("{cookie_name}={credential}"),
        })
    }

    async fn post(&self, operation: &str, parameters: Value) -> Result<String> {
        let url = format!("{}/{}", self.base_url, operation);
        let payload = json!({ "o": { "BORequestData": { "BOParameters": parameters } } });

        debug!(url = %url, "Fetching reference data");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::COOKIE, &self.cookie)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FeedError::ReferenceData(format!("{operation}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::ReferenceData(format!("{operation} failed: {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| FeedError::ReferenceData(format!("{operation}: {e}")))
    }
}

#[async_trait]
impl ReferenceSource for HttpReferenceSource {
    async fn load(&self) -> Result<ReferenceData> {
        let mut data = ReferenceData::default();

        let routing = self
            .post("GetRoutingInfo", json!({ "BORt": {}, "LanguageId": "0" }))
            .await
            .and_then(|body| data.merge_routing_info(&body));

        let schedule = self
            .post(
                "GetDashboardSchedule",
                json!({
                    "BORt": {},
                    "LanguageId": "0",
                    "LineStyle": "E",
                    "ScheduleType": "american",
                    "LinkDeriv": "true",
                    "DashboardNextHours": "0"
                }),
            )
            .await
            .and_then(|body| data.merge_schedule(&body));

        match (routing, schedule) {
            (Err(e), Err(_)) => Err(e),
            (routing, schedule) => {
                for error in [routing.err(), schedule.err()].into_iter().flatten() {
                    warn!(error = %error, "Partial reference data load");
                }
                info!(
                    sports = data.sports.len(),
                    leagues = data.leagues.len(),
                    games = data.games.len(),
                    "Reference data loaded"
                );
                Ok(data)
            }
        }
    }
}

/// Reload `table` every `every`; a failed reload keeps the previous table
pub async fn run_refresh_loop(
    source: Arc<dyn ReferenceSource>,
    table: Arc<RwLock<ReferenceData>>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; the initial load is done by the caller
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match source.load().await {
            Ok(fresh) => {
                *table.write() = fresh;
                debug!("Reference data refreshed");
            }
            Err(e) => warn!(error = %e, "Reference data refresh failed, keeping previous table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTING: &str = r#"{
        "valid": true,
        "routedSports": [
            {"sportId": "NFL", "sportDesc": "Football",
             "routedLeagues": [{"leagueId": 3, "leagueDesc": "NFL"}, {"leagueId": 4, "leagueDescEn": "NCAA"}]},
            {"sportId": "NBA", "sportDescEn": "Basketball", "routedLeagues": []}
        ]
    }"#;

    const SCHEDULE: &str = r#"{
        "valid": true,
        "Schedule": {"Data": {"Categories": [
            {"IdSport": "NFL", "CategoryName": "Ignored",
             "Leagues": {"League": [
                {"IdLeague": 3, "Description": "Ignored",
                 "dateGroup": [{"game": [
                    {"idgm": 47414947, "htm": "Chiefs", "vtm": "Bills", "LiveGame": true},
                    {"idgm": "47414948", "LiveGame": 0}
                 ]}]},
                {"IdLeague": 9, "Description": "Preseason", "dateGroup": []}
             ]}}
        ]}}
    }"#;

    #[test]
    fn test_merge_routing_info() {
        let mut data = ReferenceData::default();
        data.merge_routing_info(ROUTING).unwrap();
        assert_eq!(data.sport_name("NFL"), Some("Football"));
        assert_eq!(data.sport_name("NBA"), Some("Basketball"));
        assert_eq!(data.league_name("3"), Some("NFL"));
        assert_eq!(data.league_name("4"), Some("NCAA"));
    }

    #[test]
    fn test_merge_schedule_keeps_routing_names() {
        let mut data = ReferenceData::default();
        data.merge_routing_info(ROUTING).unwrap();
        data.merge_schedule(SCHEDULE).unwrap();

        assert_eq!(data.sport_name("NFL"), Some("Football"));
        assert_eq!(data.league_name("3"), Some("NFL"));
        assert_eq!(data.league_name("9"), Some("Preseason"));

        let game = data.game("47414947").unwrap();
        assert_eq!(game.home_team, "Chiefs");
        assert_eq!(game.away_team, "Bills");
        assert!(game.live);

        let placeholder = data.game("47414948").unwrap();
        assert_eq!(placeholder.home_team, "Home Team");
        assert!(!placeholder.live);
    }

    #[test]
    fn test_invalid_response_rejected() {
        let mut data = ReferenceData::default();
        let result = data.merge_routing_info(r#"{"valid": false}"#);
        assert!(matches!(result, Err(FeedError::ReferenceData(_))));
        assert!(data.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_table_on_failure() {
        let mut source = MockReferenceSource::new();
        let mut calls = 0;
        source.expect_load().returning(move || {
            calls += 1;
            if calls == 1 {
                Err(FeedError::ReferenceData("gateway down".into()))
            } else {
                let mut data = ReferenceData::default();
                data.sports.insert("NFL".into(), "Football v2".into());
                Ok(data)
            }
        });

        let mut initial = ReferenceData::default();
        initial.sports.insert("NFL".into(), "Football".into());
        let table = Arc::new(RwLock::new(initial));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_refresh_loop(
            Arc::new(source),
            table.clone(),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(table.read().sport_name("NFL"), Some("Football"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(table.read().sport_name("NFL"), Some("Football v2"));

        cancel.cancel();
        task.await.unwrap();
    }
}
