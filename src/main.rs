//! Live Odds Feed - Market Data Handler
//!
//! Connects to the sportsbook odds feed, keeps market state current and logs every
//! applied odds change with human-readable names.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use odds_feed::reference::run_refresh_loop;
use odds_feed::{
    AppState, Config, FeedClient, FeedEvent, HttpReferenceSource, HttpSnapshotFetcher,
    ReferenceData, ReferenceSource, StaticCredentialProvider, WsConnector,
};

/// Environment variable holding the browser session cookie
const COOKIE_ENV: &str = "MANUAL_COOKIE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting live odds feed");

    let config = Config::load()?;
    info!(topics = ?config.topics, endpoint = %config.ws_endpoint, "Configuration loaded");

    let credentials = StaticCredentialProvider::from_env(COOKIE_ENV)?;
    let credential = credentials.credential().to_string();

    // Reference data for names; the feed still runs with placeholders if this fails
    let source: Arc<dyn ReferenceSource> = Arc::new(HttpReferenceSource::new(
        &config.reference_base_url,
        &config.session_cookie_name,
        &credential,
        config.request_timeout(),
    )?);
    let reference = match source.load().await {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Reference data unavailable, using placeholder names");
            ReferenceData::default()
        }
    };
    let reference = Arc::new(RwLock::new(reference));

    let snapshots = HttpSnapshotFetcher::new(
        &config.snapshot_url,
        &config.session_cookie_name,
        &credential,
        config.request_timeout(),
    )?;
    let connector = WsConnector::new(
        &config.ws_endpoint,
        &config.origin,
        &config.session_cookie_name,
        config.connect_timeout(),
    );

    let listen_addr: SocketAddr = config.health_listen_addr.parse()?;
    let refresh_every = config.reference_refresh_secs;
    let run_duration = config.run_duration_secs.map(Duration::from_secs);

    let (handle, events) = FeedClient::new(
        config,
        Arc::new(credentials),
        Arc::new(snapshots),
        Arc::new(connector),
    )
    .with_reference(reference.clone())
    .start()?;

    let shutdown = handle.shutdown_token();

    if refresh_every > 0 {
        tokio::spawn(run_refresh_loop(
            source,
            reference,
            Duration::from_secs(refresh_every),
            shutdown.clone(),
        ));
    }

    // Start health check server
    let health_state = handle.app_state();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, listen_addr).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::spawn(log_events(events));

    let stop = shutdown.clone();
    tokio::spawn(async move {
        match run_duration {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
                    _ = tokio::time::sleep(limit) => {
                        info!(secs = limit.as_secs(), "Run duration reached")
                    }
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl-C received");
            }
        }
        stop.cancel();
    });

    let result = handle.wait().await;
    if let Err(e) = &result {
        error!(error = %e, "Feed terminated");
    }
    result?;

    info!("Live odds feed stopped");
    Ok(())
}

/// Log every downstream event
async fn log_events(mut events: mpsc::Receiver<FeedEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::StateChange(change) => {
                for outcome in &change.event.changes {
                    info!(
                        market = %change.event.market_id,
                        sequence = change.event.sequence,
                        sport = change.names.sport_name.as_deref().unwrap_or("-"),
                        league = change.names.league_name.as_deref().unwrap_or("-"),
                        game = change.names.game_name.as_deref().unwrap_or("-"),
                        market_type = change.names.market_type.as_str(),
                        live = change.names.live,
                        outcome = %outcome.outcome,
                        before = ?outcome.before.map(|q| q.price),
                        after = %outcome.after.price,
                        line = ?outcome.after.line,
                        "Odds changed"
                    );
                }
            }
            FeedEvent::Health(health) => {
                info!(
                    healthy = health.healthy,
                    state = %health.state,
                    messages_per_second = health.messages_per_second,
                    error_rate = health.error_rate,
                    issues = ?health.issues,
                    "Feed health"
                );
            }
            FeedEvent::ConnectionState(state) => info!(state = %state, "Connection state"),
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.health.lock().snapshot(tokio::time::Instant::now());
    let status = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
