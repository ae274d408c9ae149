//! POST /setup – connect the light bridge and store the session credentials.

use aura_bridge::{SetupOutcome, SetupRequest};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::AppState;

/// The bridge handshake blocks, so it runs on the blocking pool. A bridge failure is
/// still 200 with `success: false`; a request the service rejects is a 400.
pub async fn setup(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<SetupOutcome>, (StatusCode, String)> {
    let service = state.setup.clone();
    let outcome = tokio::task::spawn_blocking(move || service.configure(request))
        .await
        .map_err(|e| {
            tracing::error!(target: "aura::gateway", error = %e, "Setup task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Setup failed: {}", e),
            )
        })?
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(outcome))
}
