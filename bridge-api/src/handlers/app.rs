use axum::{routing, Router};

use super::{bindings, peers, AppState};

pub fn add_routes(router: Router<AppState>, state: AppState) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop here, just check axum health
        .route(
            "/api/v1/bindings",
            routing::post(bindings::create_binding).get(bindings::list_bindings),
        )
        .route(
            "/api/v1/bindings/:id",
            routing::get(bindings::get_binding).delete(bindings::delete_binding),
        )
        .route("/api/v1/peers", routing::get(peers::list_peers))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "bridge api"
}
