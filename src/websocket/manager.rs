//! Feed connection manager
//!
//! Owns the connection state machine and drives the lifecycle: open transport, STOMP
//! handshake, snapshot fetch, subscribe, stream, and reconnect with backoff on failure.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::client::{Connector, FrameSink, FrameStream};
use super::reconnect::Backoff;
use super::state::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
use super::ConnectionMetrics;
use crate::client::FeedEvent;
use crate::enricher::EnrichedStateChangeEvent;
use crate::error::{FeedError, Result};
use crate::parser::parse_message_body;
use crate::provider::{CredentialProvider, SnapshotFetcher};
use crate::stomp::{
    negotiate, run_heartbeat_loop, Command, Frame, FrameCodec, HeartbeatMonitor, HeartbeatPair,
    NegotiatedHeartbeat,
};
use crate::AppState;

/// Outbound frames queued per connection
const OUTBOUND_QUEUE: usize = 64;

/// How long a graceful close waits for the writer to flush DISCONNECT
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Keywords in an ERROR frame that mean the server refused our credentials
const AUTH_ERROR_MARKERS: [&str; 7] = [
    "auth",
    "login",
    "passcode",
    "credential",
    "access refused",
    "401",
    "403",
];

/// One live transport and its helper tasks
struct Session {
    frames: FrameStream,
    codec: FrameCodec,
    buffer: BytesMut,
    outbound: Option<mpsc::Sender<Frame>>,
    failures_tx: mpsc::Sender<FeedError>,
    failures: mpsc::Receiver<FeedError>,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    writer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Session {
    /// Read one chunk from the socket into the decode buffer
    async fn read_chunk(&mut self) -> Result<()> {
        tokio::select! {
            failure = self.failures.recv() => {
                Err(failure.unwrap_or_else(|| {
                    FeedError::TransportError("connection tasks stopped".into())
                }))
            }
            chunk = self.frames.next() => match chunk {
                Some(Ok(bytes)) => {
                    self.monitor.lock().record_inbound(Instant::now());
                    self.buffer.extend_from_slice(&bytes);
                    Ok(())
                }
                Some(Err(e)) => Err(e),
                None => Err(FeedError::TransportError("stream ended".into())),
            },
        }
    }

    /// Keep reading while the manager is busy elsewhere; returns only on failure
    async fn pump_inbound(&mut self) -> FeedError {
        loop {
            if let Err(e) = self.read_chunk().await {
                return e;
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| FeedError::TransportError("connection closing".into()))?;
        outbound
            .send(frame)
            .await
            .map_err(|_| FeedError::TransportError("writer task stopped".into()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Manages the feed connection with automatic reconnection
pub struct ConnectionManager {
    state: Arc<AppState>,
    credentials: Arc<dyn CredentialProvider>,
    snapshots: Arc<dyn SnapshotFetcher>,
    connector: Arc<dyn Connector>,
    metrics: ConnectionMetrics,
    machine: ConnectionStateMachine,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<FeedEvent>,
    backoff: Backoff,
    cancel: CancellationToken,
    receipts: u64,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<AppState>,
        credentials: Arc<dyn CredentialProvider>,
        snapshots: Arc<dyn SnapshotFetcher>,
        connector: Arc<dyn Connector>,
        metrics: ConnectionMetrics,
        state_tx: watch::Sender<ConnectionState>,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(state.config.reconnect_policy());
        Self {
            state,
            credentials,
            snapshots,
            connector,
            metrics,
            machine: ConnectionStateMachine::new(),
            state_tx,
            events,
            backoff,
            cancel,
            receipts: 0,
        }
    }

    /// Run until shutdown or a fatal error
    pub async fn run(mut self) -> Result<()> {
        info!(topics = ?self.state.config.topics, "Starting connection manager");

        let result = self.run_until_stopped().await;
        match &result {
            Ok(()) => {
                self.transition(ConnectionEvent::Shutdown).await?;
                info!("Connection manager stopped");
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Feed stopped on fatal error");
                self.record_error(e.kind());
                self.transition(ConnectionEvent::Fatal).await?;
            }
        }
        result
    }

    async fn run_until_stopped(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let err = match self.connect_and_stream().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            warn!(error = %err, state = %self.machine.state(), "Connection lost");
            self.record_error(err.kind());
            self.begin_reconnect().await?;

            if !self.wait_backoff().await? {
                return Ok(());
            }
        }
    }

    /// One connection from open to teardown; `Ok` means shutdown was requested
    async fn connect_and_stream(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            session = self.establish() => session?,
        };

        let result = self.read_loop(&mut session).await;
        self.close_transport(&mut session, result.is_ok()).await;
        if result.is_ok() {
            self.transition(ConnectionEvent::DisconnectRequested).await?;
        }
        result
    }

    async fn establish(&mut self) -> Result<Session> {
        let mut session = self.open_transport().await?;
        self.handshake(&mut session).await?;

        // heart-beats arriving during the fetch are buffered and keep the session alive
        let loaded = tokio::select! {
            loaded = self.load_snapshot() => loaded,
            failure = session.pump_inbound() => Err(failure),
        };
        loaded?;

        self.subscribe(&mut session).await?;
        Ok(session)
    }

    /// Move the state machine to Reconnecting after a non-fatal failure
    async fn begin_reconnect(&mut self) -> Result<()> {
        match self.machine.state() {
            ConnectionState::Connecting => {
                self.transition(ConnectionEvent::HandshakeFailed).await?;
            }
            ConnectionState::Connected | ConnectionState::Subscribed => {
                self.transition(ConnectionEvent::LivenessLost).await?;
                self.transition(ConnectionEvent::ReconnectStarted).await?;
            }
            ConnectionState::Degraded => {
                self.transition(ConnectionEvent::ReconnectStarted).await?;
            }
            // transport never opened
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            ConnectionState::Closed => {
                return Err(FeedError::ProtocolViolation("reconnect after close".into()));
            }
        }
        Ok(())
    }

    /// Sleep for the next backoff delay; `Ok(false)` when shutdown interrupts the wait
    async fn wait_backoff(&mut self) -> Result<bool> {
        let Some(delay) = self.backoff.next_delay() else {
            return Err(FeedError::MaxReconnectAttemptsExceeded {
                attempts: self.backoff.attempts(),
            });
        };
        self.metrics.reconnect_attempts.inc();

        warn!(
            attempt = self.backoff.attempts(),
            max_attempts = self.backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Ok(false),
            _ = sleep(delay) => Ok(true),
        }
    }

    /// Open the socket and start the writer task
    async fn open_transport(&mut self) -> Result<Session> {
        let credential = self.credentials.session_credential().await?;
        let (frames, sink) = self.connector.open(&credential).await?;
        self.transition(ConnectionEvent::SocketOpened).await?;

        let config = &self.state.config;
        let cancel = self.cancel.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (failures_tx, failures) = mpsc::channel(4);

        // heart-beating stays off until CONNECTED negotiates it
        let disabled = NegotiatedHeartbeat {
            send_interval: None,
            recv_deadline: None,
        };
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(
            disabled,
            Duration::ZERO,
            Instant::now(),
        )));
        let codec = FrameCodec::new(config.max_header_bytes, config.max_body_bytes);

        let writer = tokio::spawn(run_writer(
            sink,
            outbound_rx,
            codec.clone(),
            monitor.clone(),
            failures_tx.clone(),
            self.metrics.clone(),
        ));

        Ok(Session {
            frames,
            codec,
            buffer: BytesMut::with_capacity(8 * 1024),
            outbound: Some(outbound_tx),
            failures_tx,
            failures,
            monitor,
            writer: Some(writer),
            cancel,
        })
    }

    /// CONNECT, wait for CONNECTED, then start heart-beating
    async fn handshake(&mut self, session: &mut Session) -> Result<()> {
        let config = self.state.config.clone();
        let requested = config.heartbeat();

        session
            .send(Frame::connect(
                &config.stomp_host,
                &config.stomp_login,
                &config.stomp_passcode,
                requested,
            ))
            .await?;
        self.transition(ConnectionEvent::ConnectSent).await?;

        let deadline = config.handshake_timeout();
        let expires = Instant::now() + deadline;
        let frame = loop {
            let frame = timeout_at(expires, self.next_frame(session))
                .await
                .map_err(|_| FeedError::HandshakeTimeout(deadline))??;
            if !frame.is_heartbeat() {
                break frame;
            }
        };

        match frame.command {
            Command::Connected => {}
            Command::Error => {
                self.metrics.protocol_errors.inc();
                return Err(classify_error_frame(&frame));
            }
            other => {
                self.metrics.protocol_errors.inc();
                return Err(FeedError::ProtocolViolation(format!(
                    "expected CONNECTED, got {other}"
                )));
            }
        }

        let server = match frame.header("heart-beat") {
            Some(raw) => HeartbeatPair::parse(raw)?,
            None => HeartbeatPair::default(),
        };
        let negotiated = negotiate(requested, server);
        info!(
            session = frame.header("session").unwrap_or("-"),
            server = frame.header("server").unwrap_or("-"),
            send_interval = ?negotiated.send_interval,
            recv_deadline = ?negotiated.recv_deadline,
            "STOMP session established"
        );

        *session.monitor.lock() =
            HeartbeatMonitor::new(negotiated, config.heartbeat_grace(), Instant::now());
        if let Some(outbound) = session.outbound.clone() {
            tokio::spawn(run_heartbeat_loop(
                session.monitor.clone(),
                outbound,
                session.failures_tx.clone(),
                session.cancel.clone(),
            ));
        }

        self.transition(ConnectionEvent::ConnectedReceived).await?;
        Ok(())
    }

    /// Fetch and apply the snapshot, retrying with backoff
    async fn load_snapshot(&mut self) -> Result<()> {
        let mut backoff = Backoff::new(self.state.config.snapshot_policy());
        let deadline = self.state.config.request_timeout();

        loop {
            let fetched = timeout(deadline, self.snapshots.fetch_snapshot())
                .await
                .unwrap_or_else(|_| {
                    Err(FeedError::SnapshotFetchError(format!(
                        "no response within {deadline:?}"
                    )))
                });

            match fetched {
                Ok(snapshot) => {
                    let markets = snapshot.len();
                    self.state.store.write().await.apply_snapshot(snapshot);
                    info!(markets, "Market state initialized from snapshot");
                    return Ok(());
                }
                Err(e @ (FeedError::AuthRejected(_) | FeedError::AuthUnavailable(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    self.record_error(e.kind());
                    let Some(delay) = backoff.next_delay() else {
                        return Err(FeedError::SnapshotFetchError(format!(
                            "giving up after {} attempts: {e}",
                            backoff.attempts() + 1
                        )));
                    };
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Snapshot fetch failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// One SUBSCRIBE per configured destination
    async fn subscribe(&mut self, session: &mut Session) -> Result<()> {
        let destinations = self.state.config.destinations();
        for (index, destination) in destinations.iter().enumerate() {
            session
                .send(Frame::subscribe(&format!("sub-{index}"), destination))
                .await?;
            debug!(destination = %destination, "Subscribed");
        }

        self.transition(ConnectionEvent::SubscribeSent).await?;
        info!(destinations = destinations.len(), "Streaming market updates");
        Ok(())
    }

    /// Dispatch frames until shutdown (`Ok`) or a connection failure (`Err`)
    ///
    /// The reconnect budget is restored only once the session has stayed up for the
    /// configured stable period.
    async fn read_loop(&mut self, session: &mut Session) -> Result<()> {
        let cancel = self.cancel.clone();
        let stable_after = sleep(self.state.config.stable_session());
        tokio::pin!(stable_after);
        let mut stable = false;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = &mut stable_after, if !stable => {
                    stable = true;
                    self.backoff.reset();
                    debug!("Session stable, reconnect budget restored");
                    continue;
                }
                frame = self.next_frame(session) => frame?,
            };

            match frame.command {
                Command::Heartbeat => {
                    self.metrics.heartbeats_received.inc();
                    trace!("Heart-beat received");
                }
                Command::Message => self.handle_message(&frame).await,
                Command::Error => {
                    self.metrics.protocol_errors.inc();
                    return Err(classify_error_frame(&frame));
                }
                other => {
                    self.metrics.protocol_errors.inc();
                    return Err(FeedError::ProtocolViolation(format!(
                        "unexpected {other} frame while streaming"
                    )));
                }
            }
        }
    }

    /// Next decoded frame; malformed frames are counted and skipped
    async fn next_frame(&self, session: &mut Session) -> Result<Frame> {
        loop {
            match session.codec.decode(&mut session.buffer) {
                Ok(Some(frame)) => {
                    self.metrics.frames_received.inc();
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Discarding malformed frame");
                    self.metrics.malformed_frames.inc();
                    self.record_error(e.kind());
                    continue;
                }
            }

            session.read_chunk().await?;
        }
    }

    /// Parse, enrich and apply one MESSAGE body
    async fn handle_message(&self, frame: &Frame) {
        self.metrics.messages_received.inc();
        self.state.health.lock().record_message(Instant::now());

        let destination = frame.header("destination").unwrap_or("-");
        let parsed = match parse_message_body(&frame.body_text()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, destination, "Failed to parse message");
                self.metrics.parse_errors.inc();
                self.record_error(e.kind());
                return;
            }
        };
        for e in &parsed.rejected {
            warn!(error = %e, destination, "Skipping unusable market update");
            self.metrics.parse_errors.inc();
            self.record_error(e.kind());
        }

        for delta in parsed.deltas {
            let enriched = self.state.enricher.enrich(delta);
            let event = {
                let mut store = self.state.store.write().await;
                store.apply_delta(&enriched.delta)
            };

            let Some(event) = event else {
                continue;
            };
            trace!(
                market = %event.market_id,
                sequence = event.sequence,
                changes = event.changes.len(),
                "Market updated"
            );

            let event = EnrichedStateChangeEvent {
                event,
                names: enriched.names,
            };
            if self.events.send(FeedEvent::StateChange(event)).await.is_ok() {
                self.metrics.events_emitted.inc();
            }
        }
    }

    /// Stop helper tasks; on a clean shutdown send DISCONNECT first
    async fn close_transport(&mut self, session: &mut Session, graceful: bool) {
        session.cancel.cancel();

        if graceful {
            self.receipts += 1;
            let receipt = format!("disconnect-{}", self.receipts);
            if let Err(e) = session.send(Frame::disconnect(&receipt)).await {
                debug!(error = %e, "DISCONNECT not sent");
            }
        }

        session.outbound.take();
        if let Some(writer) = session.writer.take() {
            if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
                warn!("Writer did not drain before timeout");
            }
        }
    }

    async fn transition(&mut self, event: ConnectionEvent) -> Result<ConnectionState> {
        let previous = self.machine.state();
        let next = self.machine.apply(event)?;
        if next == previous {
            return Ok(next);
        }

        info!(from = %previous, to = %next, event = ?event, "Connection state changed");
        self.state.health.lock().set_connection_state(next, Instant::now());
        self.state_tx.send_replace(next);
        if self.events.send(FeedEvent::ConnectionState(next)).await.is_err() {
            debug!("Event receiver dropped");
        }
        Ok(next)
    }

    fn record_error(&self, kind: &str) {
        self.state.health.lock().record_error(kind, Instant::now());
    }
}

/// Owns the socket sink; exits once every sender is dropped or a write fails
async fn run_writer(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Frame>,
    codec: FrameCodec,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    failures: mpsc::Sender<FeedError>,
    metrics: ConnectionMetrics,
) {
    while let Some(frame) = outbound.recv().await {
        let heartbeat = frame.is_heartbeat();
        if let Err(e) = sink.send(codec.encode_frame(&frame)).await {
            warn!(error = %e, command = %frame.command, "Write failed");
            let _ = failures.try_send(e);
            return;
        }
        monitor.lock().record_outbound(Instant::now());
        if heartbeat {
            metrics.heartbeats_sent.inc();
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error closing socket");
    }
}

/// ERROR frames mentioning credentials are fatal, anything else is a protocol violation
fn classify_error_frame(frame: &Frame) -> FeedError {
    let message = frame.header("message").unwrap_or_default();
    let body = frame.body_text();
    let detail = if body.trim().is_empty() {
        message.to_string()
    } else {
        format!("{message}: {}", body.trim())
    };

    let lowered = detail.to_ascii_lowercase();
    if AUTH_ERROR_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        FeedError::AuthRejected(detail)
    } else {
        FeedError::ProtocolViolation(format!("server ERROR: {detail}"))
    }
}
