//! Connection counters

use prometheus::{IntCounter, Registry};

use crate::market::metrics::counter;

/// Per-connection-manager counters, shared with the writer task
#[derive(Clone)]
pub struct ConnectionMetrics {
    pub frames_received: IntCounter,
    pub messages_received: IntCounter,
    pub malformed_frames: IntCounter,
    pub parse_errors: IntCounter,
    pub heartbeats_sent: IntCounter,
    pub heartbeats_received: IntCounter,
    pub protocol_errors: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub events_emitted: IntCounter,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: counter("odds_feed_frames_received_total", "STOMP frames decoded"),
            messages_received: counter(
                "odds_feed_messages_received_total",
                "MESSAGE frames received",
            ),
            malformed_frames: counter(
                "odds_feed_malformed_frames_total",
                "Frames discarded as malformed",
            ),
            parse_errors: counter(
                "odds_feed_parse_errors_total",
                "MESSAGE bodies that failed to parse",
            ),
            heartbeats_sent: counter("odds_feed_heartbeats_sent_total", "Heart-beats sent"),
            heartbeats_received: counter(
                "odds_feed_heartbeats_received_total",
                "Heart-beats received",
            ),
            protocol_errors: counter(
                "odds_feed_protocol_errors_total",
                "ERROR frames and unexpected commands from the server",
            ),
            reconnect_attempts: counter(
                "odds_feed_reconnect_attempts_total",
                "Reconnect attempts scheduled",
            ),
            events_emitted: counter(
                "odds_feed_events_emitted_total",
                "State change events delivered downstream",
            ),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for metric in [
            &self.frames_received,
            &self.messages_received,
            &self.malformed_frames,
            &self.parse_errors,
            &self.heartbeats_sent,
            &self.heartbeats_received,
            &self.protocol_errors,
            &self.reconnect_attempts,
            &self.events_emitted,
        ] {
            registry.register(Box::new(metric.clone()))?;
        }
        Ok(())
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
