//! STOMP frame model

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use super::HeartbeatPair;

/// STOMP command of a frame
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Message,
    Error,
    Disconnect,
    /// Single end-of-line liveness marker
    Heartbeat,
    /// Anything else the peer sends; decodes fine, rejected by the connection layer
    Other(String),
}

impl Command {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "MESSAGE" => Command::Message,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => Command::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Heartbeat => "",
            Command::Other(raw) => raw,
        }
    }

    /// CONNECT and CONNECTED headers are never escaped (STOMP 1.2)
    pub(crate) fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Heartbeat => f.write_str("HEARTBEAT"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A single STOMP frame
///
/// Headers are kept sorted so encoding is deterministic. A body containing NUL bytes
/// only survives a round trip when a matching `content-length` header is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat)
    }

    /// CONNECT frame for the handshake
    pub fn connect(host: &str, login: &str, passcode: &str, heartbeat: HeartbeatPair) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("login", login)
            .with_header("passcode", passcode)
            .with_header("heart-beat", heartbeat.to_header())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header("receipt", receipt)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    /// Body as UTF-8 text, lossy
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
