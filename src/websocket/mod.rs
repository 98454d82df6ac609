//! WebSocket module for feed connection management

mod client;
mod manager;
mod metrics;
mod reconnect;
mod state;

pub use client::{Connector, FrameSink, FrameStream, WsConnector};
pub use manager::ConnectionManager;
pub use metrics::ConnectionMetrics;
pub use reconnect::{Backoff, BackoffPolicy};
pub use state::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
