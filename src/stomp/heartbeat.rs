//! Heart-beat negotiation and liveness deadlines
//!
//! The monitor is a plain state holder driven with explicit instants; `run_heartbeat_loop`
//! is the periodic task that polls it for a live connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Frame;
use crate::error::{FeedError, Result};

/// `heart-beat` header value: `send_ms,recv_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatPair {
    /// Smallest interval at which this side can send
    pub send_ms: u64,
    /// Desired interval at which this side wants to receive
    pub recv_ms: u64,
}

impl HeartbeatPair {
    pub fn new(send_ms: u64, recv_ms: u64) -> Self {
        Self { send_ms, recv_ms }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (send, recv) = raw
            .split_once(',')
            .ok_or_else(|| FeedError::ProtocolViolation(format!("invalid heart-beat: {raw}")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| FeedError::ProtocolViolation(format!("invalid heart-beat: {raw}")))
        };
        Ok(Self::new(parse(send)?, parse(recv)?))
    }

    pub fn to_header(&self) -> String {
        format!("{},{}", self.send_ms, self.recv_ms)
    }
}

/// Effective intervals after negotiation; `None` disables that direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedHeartbeat {
    pub send_interval: Option<Duration>,
    pub recv_deadline: Option<Duration>,
}

/// Combine our requested pair with the server's CONNECTED pair (max of the minimums)
pub fn negotiate(client: HeartbeatPair, server: HeartbeatPair) -> NegotiatedHeartbeat {
    let combine = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };

    NegotiatedHeartbeat {
        send_interval: combine(client.send_ms, server.recv_ms),
        recv_deadline: combine(client.recv_ms, server.send_ms),
    }
}

/// What the periodic check asks the connection to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendHeartbeat,
    PeerTimeout(Duration),
}

/// Tracks the outbound and inbound deadlines of one connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    send_interval: Option<Duration>,
    recv_deadline: Option<Duration>,
    last_inbound: Instant,
    last_outbound: Instant,
    timed_out: bool,
}

impl HeartbeatMonitor {
    /// `grace` is added to the inbound deadline to absorb network jitter
    pub fn new(negotiated: NegotiatedHeartbeat, grace: Duration, now: Instant) -> Self {
        Self {
            send_interval: negotiated.send_interval,
            recv_deadline: negotiated.recv_deadline.map(|d| d + grace),
            last_inbound: now,
            last_outbound: now,
            timed_out: false,
        }
    }

    /// Any inbound bytes count, data or heartbeat
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn record_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    pub fn recv_deadline(&self) -> Option<Duration> {
        self.recv_deadline
    }

    pub fn send_interval(&self) -> Option<Duration> {
        self.send_interval
    }

    /// Peer timeout is reported once; later polls stay idle
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if self.timed_out {
            return HeartbeatAction::Idle;
        }

        if let Some(deadline) = self.recv_deadline {
            let silent = now.saturating_duration_since(self.last_inbound);
            if silent > deadline {
                self.timed_out = true;
                return HeartbeatAction::PeerTimeout(silent);
            }
        }

        if let Some(send_every) = self.send_interval {
            if now.saturating_duration_since(self.last_outbound) >= send_every {
                return HeartbeatAction::SendHeartbeat;
            }
        }

        HeartbeatAction::Idle
    }

    /// Polling period fine enough for both deadlines, or `None` when heartbeats are off
    pub fn check_period(&self) -> Option<Duration> {
        let finest = match (self.send_interval, self.recv_deadline) {
            (Some(send), Some(recv)) => send.min(recv),
            (Some(one), None) | (None, Some(one)) => one,
            (None, None) => return None,
        };
        Some((finest / 4).clamp(Duration::from_millis(5), Duration::from_secs(1)))
    }
}

/// Periodic liveness task for one connection
///
/// Emits heartbeat frames on `outbound` and reports a peer timeout on `failures`,
/// then exits. Stops when `cancel` fires or the outbound queue closes.
pub async fn run_heartbeat_loop(
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    outbound: mpsc::Sender<Frame>,
    failures: mpsc::Sender<FeedError>,
    cancel: CancellationToken,
) {
    let Some(period) = monitor.lock().check_period() else {
        debug!("Heart-beating disabled by negotiation");
        return;
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let action = monitor.lock().poll(Instant::now());
        match action {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendHeartbeat => {
                if outbound.send(Frame::heartbeat()).await.is_err() {
                    return;
                }
            }
            HeartbeatAction::PeerTimeout(silent) => {
                warn!(silent_ms = silent.as_millis() as u64, "Peer heart-beat deadline missed");
                let _ = failures.send(FeedError::HeartbeatTimeout(silent)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(HeartbeatPair::parse("10000, 5000").unwrap(), HeartbeatPair::new(10_000, 5_000));
        assert!(HeartbeatPair::parse("10000").is_err());
        assert!(HeartbeatPair::parse("a,b").is_err());
    }

    #[test]
    fn test_negotiate_takes_max_of_minimums() {
        let negotiated = negotiate(
            HeartbeatPair::new(20_000, 20_000),
            HeartbeatPair::new(10_000, 30_000),
        );
        assert_eq!(negotiated.send_interval, Some(Duration::from_secs(30)));
        assert_eq!(negotiated.recv_deadline, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_negotiate_zero_disables_direction() {
        let negotiated = negotiate(HeartbeatPair::new(20_000, 20_000), HeartbeatPair::new(0, 0));
        assert_eq!(negotiated.send_interval, None);
        assert_eq!(negotiated.recv_deadline, None);

        let negotiated = negotiate(HeartbeatPair::new(0, 20_000), HeartbeatPair::new(5_000, 5_000));
        assert_eq!(negotiated.send_interval, None);
        assert_eq!(negotiated.recv_deadline, Some(Duration::from_secs(20)));
    }

    fn monitor(now: Instant) -> HeartbeatMonitor {
        let negotiated = NegotiatedHeartbeat {
            send_interval: Some(Duration::from_secs(10)),
            recv_deadline: Some(Duration::from_secs(20)),
        };
        HeartbeatMonitor::new(negotiated, Duration::ZERO, now)
    }

    #[test]
    fn test_outbound_deadline() {
        let start = Instant::now();
        let mut monitor = monitor(start);

        assert_eq!(monitor.poll(start + Duration::from_secs(5)), HeartbeatAction::Idle);
        assert_eq!(monitor.poll(start + Duration::from_secs(10)), HeartbeatAction::SendHeartbeat);

        monitor.record_outbound(start + Duration::from_secs(10));
        monitor.record_inbound(start + Duration::from_secs(10));
        assert_eq!(monitor.poll(start + Duration::from_secs(15)), HeartbeatAction::Idle);
    }

    #[test]
    fn test_inbound_traffic_keeps_connection_alive() {
        let start = Instant::now();
        let mut monitor = monitor(start);

        for secs in [15, 30, 45, 60] {
            monitor.record_inbound(start + Duration::from_secs(secs));
            monitor.record_outbound(start + Duration::from_secs(secs));
            assert_eq!(monitor.poll(start + Duration::from_secs(secs + 1)), HeartbeatAction::Idle);
        }
    }

    #[test]
    fn test_peer_timeout_fires_once() {
        let start = Instant::now();
        let mut monitor = monitor(start);

        let action = monitor.poll(start + Duration::from_secs(21));
        assert_eq!(action, HeartbeatAction::PeerTimeout(Duration::from_secs(21)));
        assert_eq!(monitor.poll(start + Duration::from_secs(30)), HeartbeatAction::Idle);
    }

    #[test]
    fn test_grace_extends_deadline() {
        let start = Instant::now();
        let negotiated = NegotiatedHeartbeat {
            send_interval: None,
            recv_deadline: Some(Duration::from_secs(20)),
        };
        let mut monitor = HeartbeatMonitor::new(negotiated, Duration::from_secs(5), start);
        assert_eq!(monitor.poll(start + Duration::from_secs(22)), HeartbeatAction::Idle);
        assert!(matches!(
            monitor.poll(start + Duration::from_secs(26)),
            HeartbeatAction::PeerTimeout(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sends_heartbeats_then_reports_timeout() {
        let negotiated = NegotiatedHeartbeat {
            send_interval: Some(Duration::from_millis(100)),
            recv_deadline: Some(Duration::from_millis(250)),
        };
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(
            negotiated,
            Duration::ZERO,
            Instant::now(),
        )));
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (fail_tx, mut fail_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_heartbeat_loop(monitor.clone(), out_tx, fail_tx, cancel));

        let frame = out_rx.recv().await.unwrap();
        assert!(frame.is_heartbeat());

        let failure = fail_rx.recv().await.unwrap();
        assert!(matches!(failure, FeedError::HeartbeatTimeout(_)));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let negotiated = NegotiatedHeartbeat {
            send_interval: Some(Duration::from_secs(10)),
            recv_deadline: None,
        };
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(
            negotiated,
            Duration::ZERO,
            Instant::now(),
        )));
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (fail_tx, _fail_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_heartbeat_loop(monitor, out_tx, fail_tx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
