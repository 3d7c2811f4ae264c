//! Order book sync runner
//!
//! Keeps one book subscription alive, logs its state and serves health and
//! metrics endpoints.

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_sync::{
    engine, telemetry, BookSnapshot, Config, ConnectionStatus, EngineEvent, EngineHandle,
    ReconnectPolicy, SpawnedEngine, WebSocketTransport,
};

/// State shared with the health server
struct HealthState {
    handle: EngineHandle,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting order book sync");

    let config = Arc::new(Config::load()?);
    info!(
        symbol = %config.symbol,
        precision = config.precision,
        top_n = config.top_n,
        "Configuration loaded"
    );

    let SpawnedEngine {
        handle,
        mut events,
        task,
    } = engine::spawn(
        config.as_ref().clone(),
        WebSocketTransport::new(&config.ws_endpoint),
    )?;

    let health_state = Arc::new(HealthState {
        handle: handle.clone(),
        config: config.clone(),
    });
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    handle.connect()?;

    let mut policy = ReconnectPolicy::new(config.reconnect_delay_ms);
    let mut latest: Option<BookSnapshot> = None;
    let mut status_interval = interval(Duration::from_secs(30));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                handle.shutdown()?;
                break;
            }
            _ = status_interval.tick() => {
                if let Some(snapshot) = &latest {
                    let metrics = snapshot.metrics();
                    info!(
                        symbol = %snapshot.symbol,
                        precision = snapshot.precision,
                        mid_price = ?metrics.mid_price,
                        spread_bps = ?metrics.spread_bps,
                        bid_levels = metrics.bid_levels,
                        ask_levels = metrics.ask_levels,
                        "Order book status"
                    );
                }
            }
            event = events.recv() => match event {
                Some(EngineEvent::Status(status)) => {
                    info!(status = %status, "Connection status changed");
                    match status {
                        ConnectionStatus::Subscribed => policy.on_subscribed(),
                        ConnectionStatus::Stalled | ConnectionStatus::Disconnected
                            if config.auto_reconnect =>
                        {
                            schedule_reconnect(handle.clone(), policy.next_delay(), policy.attempts());
                        }
                        _ => {}
                    }
                }
                Some(EngineEvent::Snapshot(snapshot)) => {
                    if let (Some(bid), Some(ask)) = (snapshot.bids.first(), snapshot.asks.first()) {
                        debug!(best_bid = %bid.price, best_ask = %ask.price, "Book updated");
                    }
                    latest = Some(snapshot);
                }
                Some(EngineEvent::Warning(warning)) => {
                    warn!(warning = ?warning, "Engine warning");
                }
                None => break,
            },
        }
    }

    task.await?;
    Ok(())
}

/// Reconnect after `delay` unless the feed has recovered in the meantime
fn schedule_reconnect(handle: EngineHandle, delay: Duration, attempt: u32) {
    warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
    tokio::spawn(async move {
        sleep(delay).await;
        if matches!(
            handle.status(),
            ConnectionStatus::Stalled | ConnectionStatus::Disconnected
        ) {
            if let Err(e) = handle.reconnect() {
                warn!(error = %e, "Reconnect request failed");
            }
        }
    });
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<HealthState>) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

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

async fn health_check(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    let status = state.handle.status();
    Json(serde_json::json!({
        "status": if status == ConnectionStatus::Subscribed { "healthy" } else { "degraded" },
        "connection": status,
        "symbol": state.config.symbol,
        "component": "orderbook-sync",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics() -> String {
    telemetry::render()
}
