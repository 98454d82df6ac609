//! Connection lifecycle state machine

use std::fmt;

use serde::Serialize;

use crate::error::{FeedError, Result};

/// Lifecycle state of the feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Degraded,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    SocketOpened,
    ConnectSent,
    ConnectedReceived,
    /// Handshake timeout or ERROR frame before CONNECTED
    HandshakeFailed,
    SubscribeSent,
    /// Peer heartbeat timeout or socket error
    LivenessLost,
    DisconnectRequested,
    ReconnectStarted,
    /// Auth rejection or exhausted retry budget
    Fatal,
    Shutdown,
}

/// Owns the current state and rejects transitions not in the table
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an event, returning the new state
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        let next = match (self.state, event) {
            (_, Fatal) | (_, Shutdown) => Closed,
            (Closed, _) => {
                return Err(FeedError::ProtocolViolation(format!(
                    "{event:?} after connection closed"
                )));
            }
            (Disconnected, SocketOpened) | (Reconnecting, SocketOpened) => Connecting,
            (Connecting, ConnectSent) => Connecting,
            (Connecting, ConnectedReceived) => Connected,
            (Connecting, HandshakeFailed) => Reconnecting,
            (Connected, SubscribeSent) => Subscribed,
            (Connected, LivenessLost) | (Subscribed, LivenessLost) => Degraded,
            (Subscribed, DisconnectRequested) => Closed,
            (Degraded, ReconnectStarted) => Reconnecting,
            (state, event) => {
                return Err(FeedError::ProtocolViolation(format!(
                    "invalid transition: {event:?} in state {state}"
                )));
            }
        };

        self.state = next;
        Ok(next)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;

    #[test]
    fn test_happy_path() {
        let mut machine = ConnectionStateMachine::new();
        assert_eq!(machine.apply(SocketOpened).unwrap(), ConnectionState::Connecting);
        assert_eq!(machine.apply(ConnectSent).unwrap(), ConnectionState::Connecting);
        assert_eq!(machine.apply(ConnectedReceived).unwrap(), ConnectionState::Connected);
        assert_eq!(machine.apply(SubscribeSent).unwrap(), ConnectionState::Subscribed);
        assert_eq!(machine.apply(DisconnectRequested).unwrap(), ConnectionState::Closed);
    }

    #[test]
    fn test_degrade_and_reconnect_cycle() {
        let mut machine = ConnectionStateMachine::new();
        for event in [SocketOpened, ConnectedReceived, SubscribeSent, LivenessLost] {
            machine.apply(event).unwrap();
        }
        assert_eq!(machine.state(), ConnectionState::Degraded);
        assert_eq!(machine.apply(ReconnectStarted).unwrap(), ConnectionState::Reconnecting);
        assert_eq!(machine.apply(SocketOpened).unwrap(), ConnectionState::Connecting);
        assert_eq!(machine.apply(HandshakeFailed).unwrap(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut machine = ConnectionStateMachine::new();
        assert!(matches!(
            machine.apply(SubscribeSent),
            Err(FeedError::ProtocolViolation(_))
        ));
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        machine.apply(SocketOpened).unwrap();
        assert!(machine.apply(LivenessLost).is_err());
        assert!(machine.apply(ReconnectStarted).is_err());
    }

    #[test]
    fn test_fatal_closes_from_any_state() {
        for setup in [vec![], vec![SocketOpened], vec![SocketOpened, ConnectedReceived]] {
            let mut machine = ConnectionStateMachine::new();
            for event in setup {
                machine.apply(event).unwrap();
            }
            assert_eq!(machine.apply(Fatal).unwrap(), ConnectionState::Closed);
            assert!(machine.apply(SocketOpened).is_err());
        }
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
    }
}
