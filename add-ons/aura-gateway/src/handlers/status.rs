//! Liveness and status.

use axum::extract::State;
use axum::Json;

use crate::AppState;

/// GET /api/v1/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "aura-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/v1/status – worker state, queue and dispatch counters. Never includes the key.
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.store.get();
    let uptime_secs = (chrono::Utc::now() - state.started_at).num_seconds();
    Json(serde_json::json!({
        "connection": state.session.state(),
        "session_running": state.session.is_running(),
        "session": state.session.metrics(),
        "credential_configured": config.has_credential(),
        "device_address": &config.device_address,
        "actuator": config.actuator(),
        "actuator_connected": state.dispatcher.has_driver(),
        "queue": {
            "depth": state.queue.len(),
            "max_depth": state.queue.max_depth(),
            "dropped": state.queue.dropped(),
        },
        "dispatch": state.dispatcher.stats(),
        "confidence_threshold": state.config.confidence_threshold,
        "last_detection": state.observers.last(),
        "listeners": state.observers.listener_count(),
        "uptime_secs": uptime_secs,
    }))
}
