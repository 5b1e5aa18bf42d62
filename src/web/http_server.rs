//! HTTP server for the signaling relay
//!
//! Serves the relay WebSocket plus health and metrics endpoints.

use crate::web::shared::RelayState;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use log::info;
use tokio::net::TcpListener;

/// Build the relay router
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/signaling", get(signaling_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the relay until the listener fails
pub async fn run_relay_server(state: RelayState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Signaling relay listening on ws://{}/signaling", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| crate::transport::handle_signaling_connection(socket, state))
}

/// Health check handler
async fn health_handler(State(state): State<RelayState>) -> String {
    let uptime = state.uptime();

    format!(
        r#"{{
  "status": "healthy",
  "uptime_seconds": {:.2},
  "connections": {},
  "active_calls": {},
  "version": "{}"
}}"#,
        uptime.as_secs_f64(),
        state.connection_count(),
        state.active_pairs(),
        env!("CARGO_PKG_VERSION")
    )
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(State(state): State<RelayState>) -> String {
    let stats = state.stats();

    format!(
        r#"# HELP callcore_uptime_seconds Relay uptime in seconds
# TYPE callcore_uptime_seconds counter
callcore_uptime_seconds {}
# HELP callcore_connections Currently registered participants
# TYPE callcore_connections gauge
callcore_connections {}
# HELP callcore_active_calls Participant pairs currently in a call
# TYPE callcore_active_calls gauge
callcore_active_calls {}
# HELP callcore_frames_forwarded_total Signaling frames delivered
# TYPE callcore_frames_forwarded_total counter
callcore_frames_forwarded_total {}
# HELP callcore_offers_total Offers received
# TYPE callcore_offers_total counter
callcore_offers_total {}
# HELP callcore_offline_rejections_total Offers rejected because the callee was offline
# TYPE callcore_offline_rejections_total counter
callcore_offline_rejections_total {}
# HELP callcore_invalid_frames_total Frames that failed to decode
# TYPE callcore_invalid_frames_total counter
callcore_invalid_frames_total {}
"#,
        state.uptime().as_secs_f64(),
        state.connection_count(),
        state.active_pairs(),
        stats.frames_forwarded,
        stats.offers,
        stats.offline_rejections,
        stats.invalid_frames
    )
}
