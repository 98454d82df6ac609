//! Configuration module for the odds feed

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FeedError, Result};
use crate::health::HealthConfig;
use crate::stomp::HeartbeatPair;
use crate::websocket::BackoffPolicy;

/// Prefix for environment overrides, e.g. `ODDS_FEED_STALE_THRESHOLD_SECS=30`
const ENV_PREFIX: &str = "ODDS_FEED";

/// Optional configuration file looked up in the working directory
const CONFIG_FILE: &str = "odds-feed";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket endpoint carrying the STOMP session
    pub ws_endpoint: String,

    /// Origin header sent with the WebSocket upgrade
    pub origin: String,

    /// Cookie name the session credential is sent under
    pub session_cookie_name: String,

    /// STOMP virtual host and login sent in CONNECT
    pub stomp_host: String,
    pub stomp_login: String,
    pub stomp_passcode: String,

    /// Exchange the topics are bound to
    pub exchange: String,

    /// Routing keys to subscribe to (e.g., ["GAME", "TNT", "HB", "mrc"])
    pub topics: Vec<String>,

    /// REST endpoint returning the full market snapshot
    pub snapshot_url: String,

    /// Base URL of the reference data gateway (sports, leagues, games)
    pub reference_base_url: String,

    /// Reference data refresh interval in seconds (0 = load once)
    pub reference_refresh_secs: u64,

    /// Heart-beat pair requested in CONNECT: can send every N ms, want to receive every M ms
    pub heartbeat_send_ms: u64,
    pub heartbeat_recv_ms: u64,

    /// Tolerance added to the negotiated inbound deadline
    pub heartbeat_grace_ms: u64,

    /// Deadline for the CONNECTED frame after CONNECT is sent
    pub handshake_timeout_ms: u64,

    /// Deadline for the WebSocket upgrade
    pub connect_timeout_ms: u64,

    /// Deadline for each REST call (snapshot, reference data)
    pub request_timeout_ms: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: f64,
    pub max_reconnect_attempts: u32,

    /// A session must stay subscribed this long before the reconnect budget is restored
    pub stable_session_secs: u64,

    /// Snapshot fetch attempts per connection before giving up
    pub snapshot_max_attempts: u32,

    /// Health settings
    pub stale_threshold_secs: u64,
    pub error_rate_threshold: f64,
    pub health_window_secs: u64,
    pub degraded_grace_secs: u64,
    pub health_check_interval_secs: u64,

    /// Capacity of the downstream event queue
    pub event_buffer: usize,

    /// Codec limits
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,

    /// Address for the /health and /metrics server
    pub health_listen_addr: String,

    /// Stop after this many seconds (runs until Ctrl-C when unset)
    pub run_duration_secs: Option<u64>,
}

impl Config {
    /// Load configuration from `.env`, an optional `odds-feed.toml` and `ODDS_FEED_*` variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load configuration using the given file (extension optional) as the file layer
    pub fn load_from(file: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("topics"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the client spin or never connect
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(FeedError::ConfigError("at least one topic is required".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(FeedError::ConfigError("handshake_timeout_ms must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(FeedError::ConfigError(
                "connect_timeout_ms and request_timeout_ms must be > 0".into(),
            ));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(FeedError::ConfigError(format!(
                "error_rate_threshold must be in (0, 1], got {}",
                self.error_rate_threshold
            )));
        }
        if self.reconnect_max_delay_ms < self.reconnect_delay_ms {
            return Err(FeedError::ConfigError(
                "reconnect_max_delay_ms must be >= reconnect_delay_ms".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(FeedError::ConfigError("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    /// SUBSCRIBE destinations, one per topic
    pub fn destinations(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|topic| format!("/exchange/{}/{}", self.exchange, topic))
            .collect()
    }

    pub fn heartbeat(&self) -> HeartbeatPair {
        HeartbeatPair::new(self.heartbeat_send_ms, self.heartbeat_recv_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stable_session(&self) -> Duration {
        Duration::from_secs(self.stable_session_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn reconnect_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            multiplier: self.reconnect_multiplier,
            jitter: self.reconnect_jitter,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Snapshot retries share the reconnect timings with their own attempt cap
    pub fn snapshot_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.snapshot_max_attempts,
            ..self.reconnect_policy()
        }
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            window: Duration::from_secs(self.health_window_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            error_rate_threshold: self.error_rate_threshold,
            degraded_grace: Duration::from_secs(self.degraded_grace_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_endpoint: "wss://be.bookmaker.eu/gateway/handlers/RealTimeHandler.ashx?f=ws"
                .to_string(),
            origin: "https://www.bookmaker.eu".to_string(),
            session_cookie_name: "ASP.NET_SessionId".to_string(),
            stomp_host: "WebRT".to_string(),
            stomp_login: "rtweb".to_string(),
            stomp_passcode: "rtweb".to_string(),
            exchange: "BetSlipRTv4Topics".to_string(),
            topics: vec![
                "GAME".to_string(),
                "TNT".to_string(),
                "HB".to_string(),
                "mrc".to_string(),
            ],
            snapshot_url: "https://be.bookmaker.eu/gateway/BetslipProxy.aspx/GetMarketSnapshot"
                .to_string(),
            reference_base_url: "https://be.bookmaker.eu/gateway/BetslipProxy.aspx".to_string(),
            reference_refresh_secs: 300,
            heartbeat_send_ms: 20_000,
            heartbeat_recv_ms: 20_000,
            heartbeat_grace_ms: 5_000,
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            request_timeout_ms: 30_000,
            reconnect_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.3,
            max_reconnect_attempts: 10,
            stable_session_secs: 60,
            snapshot_max_attempts: 3,
            stale_threshold_secs: 60,
            error_rate_threshold: 0.10,
            health_window_secs: 60,
            degraded_grace_secs: 30,
            health_check_interval_secs: 10,
            event_buffer: 1024,
            max_header_bytes: 8 * 1024,
            max_body_bytes: 1024 * 1024,
            health_listen_addr: "0.0.0.0:9090".to_string(),
            run_duration_secs: None,
        }
    }
}
