use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::error;

use bridge_common::peer::Peer;

use super::bindings::ErrorResponse;
use super::AppState;

/// Peers holding an unexpired lease. Departed and lapsed peers are
/// invisible here, exactly as they are to the assignment function.
pub async fn list_peers(
    State(state): State<AppState>,
) -> Result<Json<Vec<Peer>>, (StatusCode, Json<ErrorResponse>)> {
    let peers = state.peers.list_live().await.map_err(|store_error| {
        error!("failed to list peers: {}", store_error);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: store_error.to_string(),
            }),
        )
    })?;
    Ok(Json(peers))
}
