//! Live Odds Feed - Market State Library
//!
//! This crate connects to a sportsbook's STOMP-over-WebSocket odds feed, maintains
//! per-market state from a snapshot plus sequenced deltas, and emits enriched
//! state change events together with feed health.

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::Registry;
use tokio::sync::RwLock;

pub mod client;
pub mod config;
pub mod enricher;
pub mod error;
pub mod health;
pub mod market;
pub mod parser;
pub mod provider;
pub mod reference;
pub mod stomp;
pub mod websocket;

pub use client::{FeedClient, FeedEvent, FeedHandle};
pub use config::Config;
pub use enricher::{
    DisplayNames, EnrichedDelta, EnrichedStateChangeEvent, MarketType, MessageEnricher,
};
pub use error::{FeedError, Result};
pub use health::{HealthConfig, HealthMonitor, HealthSnapshot};
pub use market::{
    Delta, MarketIds, MarketRecord, MarketSnapshot, MarketStateStore, OutcomeChange,
    OutcomeQuote, StateChangeEvent,
};
pub use provider::{
    CredentialProvider, HttpSnapshotFetcher, SnapshotFetcher, StaticCredentialProvider,
};
pub use reference::{HttpReferenceSource, ReferenceData, ReferenceSource};
pub use stomp::{Frame, FrameCodec};
pub use websocket::{ConnectionManager, ConnectionState, Connector, WsConnector};

/// Application state shared across components
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<RwLock<MarketStateStore>>,
    pub enricher: MessageEnricher,
    pub health: Arc<Mutex<HealthMonitor>>,
    pub registry: Registry,
}
