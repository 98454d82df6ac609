//! Feed client: wires the collaborators together and exposes the event stream

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::enricher::{EnrichedStateChangeEvent, MessageEnricher};
use crate::error::{FeedError, Result};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::market::{MarketStateStore, StoreMetrics};
use crate::provider::{CredentialProvider, SnapshotFetcher};
use crate::reference::ReferenceData;
use crate::websocket::{ConnectionManager, ConnectionMetrics, ConnectionState, Connector};
use crate::AppState;

/// Everything delivered to the consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedEvent {
    StateChange(EnrichedStateChangeEvent),
    Health(HealthSnapshot),
    ConnectionState(ConnectionState),
}

/// Live odds feed client
pub struct FeedClient {
    config: Arc<Config>,
    credentials: Arc<dyn CredentialProvider>,
    snapshots: Arc<dyn SnapshotFetcher>,
    connector: Arc<dyn Connector>,
    reference: Arc<RwLock<ReferenceData>>,
}

impl FeedClient {
    pub fn new(
        config: Config,
        credentials: Arc<dyn CredentialProvider>,
        snapshots: Arc<dyn SnapshotFetcher>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            credentials,
            snapshots,
            connector,
            reference: Arc::new(RwLock::new(ReferenceData::default())),
        }
    }

    /// Use an existing (possibly refreshed) reference table for enrichment
    pub fn with_reference(mut self, reference: Arc<RwLock<ReferenceData>>) -> Self {
        self.reference = reference;
        self
    }

    /// Start the connection manager and health reporter
    pub fn start(self) -> Result<(FeedHandle, mpsc::Receiver<FeedEvent>)> {
        self.config.validate()?;

        let registry = Registry::new();
        let store_metrics = StoreMetrics::new();
        let connection_metrics = ConnectionMetrics::new();
        store_metrics
            .register(&registry)
            .and_then(|_| connection_metrics.register(&registry))
            .map_err(|e| FeedError::ConfigError(format!("metrics registration: {e}")))?;

        let state = Arc::new(AppState {
            store: Arc::new(tokio::sync::RwLock::new(MarketStateStore::new(store_metrics))),
            enricher: MessageEnricher::new(self.reference),
            health: Arc::new(Mutex::new(HealthMonitor::new(
                self.config.health(),
                Instant::now(),
            ))),
            registry,
            config: self.config.clone(),
        });

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let manager = ConnectionManager::new(
            state.clone(),
            self.credentials,
            self.snapshots,
            self.connector,
            connection_metrics,
            state_tx,
            events_tx.clone(),
            cancel.clone(),
        );
        let manager_task = tokio::spawn(manager.run());

        let reporter_task = tokio::spawn(run_health_reporter(
            state.clone(),
            events_tx,
            Duration::from_secs(self.config.health_check_interval_secs.max(1)),
            cancel.clone(),
        ));

        info!("Feed client started");
        Ok((
            FeedHandle {
                state,
                state_rx,
                cancel,
                manager_task: Some(manager_task),
                reporter_task: Some(reporter_task),
            },
            events_rx,
        ))
    }
}

/// Control handle for a running client
pub struct FeedHandle {
    state: Arc<AppState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    manager_task: Option<JoinHandle<Result<()>>>,
    reporter_task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel following every state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Pull a health snapshot now
    pub fn health(&self) -> HealthSnapshot {
        self.state.health.lock().snapshot(Instant::now())
    }

    pub fn store(&self) -> Arc<tokio::sync::RwLock<MarketStateStore>> {
        self.state.store.clone()
    }

    pub fn app_state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Token that stops the client when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a clean DISCONNECT and wait for the manager to stop
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down feed client");
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the manager to stop on its own (fatal error or external cancel)
    pub async fn wait(mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let result = match self.manager_task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| {
                    Err(FeedError::TransportError(format!(
                        "manager task failed: {e}"
                    )))
                }),
            None => Ok(()),
        };

        self.cancel.cancel();
        if let Some(task) = self.reporter_task.take() {
            let _ = task.await;
        }
        result
    }
}

/// Push a health snapshot downstream on every tick
async fn run_health_reporter(
    state: Arc<AppState>,
    events: mpsc::Sender<FeedEvent>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshot = state.health.lock().snapshot(Instant::now());
        if !snapshot.healthy {
            warn!(issues = ?snapshot.issues, state = %snapshot.state, "Feed unhealthy");
        } else {
            debug!(
                messages_per_second = snapshot.messages_per_second,
                error_rate = snapshot.error_rate,
                "Feed healthy"
            );
        }

        if events.send(FeedEvent::Health(snapshot)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockCredentialProvider, MockSnapshotFetcher};
    use crate::websocket::{FrameSink, FrameStream};
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn open(&self, _credential: &str) -> Result<(FrameStream, FrameSink)> {
            Err(FeedError::AuthRejected("upgrade rejected with 403 Forbidden".into()))
        }
    }

    fn client(config: Config) -> FeedClient {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_session_credential()
            .returning(|| Ok("session".to_string()));
        FeedClient::new(
            config,
            Arc::new(credentials),
            Arc::new(MockSnapshotFetcher::new()),
            Arc::new(RefusingConnector),
        )
    }

    #[tokio::test]
    async fn test_auth_rejection_ends_client() {
        let (handle, mut events) = client(Config::default()).start().unwrap();
        let mut states = handle.state_changes();

        let result = handle.wait().await;
        assert!(matches!(result, Err(FeedError::AuthRejected(_))));
        assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            if event == FeedEvent::ConnectionState(ConnectionState::Closed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reported_on_interval() {
        let config = Config {
            health_check_interval_secs: 5,
            ..Config::default()
        };
        let (handle, mut events) = client(config).start().unwrap();

        let health = loop {
            if let FeedEvent::Health(health) = events.recv().await.unwrap() {
                break health;
            }
        };
        assert!(!health.healthy);
        assert_eq!(health.state, ConnectionState::Closed);
        assert!(!handle.health().healthy);
        assert!(handle.registry().gather().len() >= 10);

        let _ = handle.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected_before_start() {
        let config = Config {
            topics: vec![],
            ..Config::default()
        };
        assert!(matches!(client(config).start(), Err(FeedError::ConfigError(_))));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json =
            serde_json::to_value(FeedEvent::ConnectionState(ConnectionState::Degraded)).unwrap();
        assert_eq!(json["type"], "connection_state");
        assert_eq!(json["data"], "degraded");
    }
}
