//! Error types for the odds feed

use std::time::Duration;

use thiserror::Error;

/// Odds feed errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Session credential unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Snapshot fetch failed: {0}")]
    SnapshotFetchError(String),

    #[error("Heartbeat timeout: nothing received for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    #[error("Reference data error: {0}")]
    ReferenceData(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Max reconnection attempts exceeded after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },
}

impl FeedError {
    /// Fatal errors end the client; everything else is retried or skipped locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::AuthRejected(_)
                | FeedError::AuthUnavailable(_)
                | FeedError::SnapshotFetchError(_)
                | FeedError::ConfigError(_)
                | FeedError::MaxReconnectAttemptsExceeded { .. }
        )
    }

    /// Short label used for health accounting and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::MalformedFrame(_) => "malformed_frame",
            FeedError::ProtocolViolation(_) => "protocol_violation",
            FeedError::AuthRejected(_) => "auth_rejected",
            FeedError::AuthUnavailable(_) => "auth_unavailable",
            FeedError::TransportError(_) => "transport_error",
            FeedError::SnapshotFetchError(_) => "snapshot_fetch_error",
            FeedError::HeartbeatTimeout(_) => "heartbeat_timeout",
            FeedError::HandshakeTimeout(_) => "handshake_timeout",
            FeedError::ParseError(_) => "parse_error",
            FeedError::ReferenceData(_) => "reference_data",
            FeedError::ConfigError(_) => "config_error",
            FeedError::MaxReconnectAttemptsExceeded { .. } => "max_reconnect_attempts",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::SnapshotFetchError(err.to_string())
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        FeedError::TransportError(err.to_string())
    }
}

impl From<config::ConfigError> for FeedError {
    fn from(err: config::ConfigError) -> Self {
        FeedError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
