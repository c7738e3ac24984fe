use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use bridge_common::assignment;
use bridge_common::binding::{Binding, NewBinding};
use bridge_common::store::StoreError;

use super::AppState;

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// A binding plus the peer currently responsible for it. The assignment
/// is computed from the live-peer set on every request and is never
/// stored; it is advisory and may change by the time a caller reads it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BindingResponse {
    #[serde(flatten)]
    pub binding: Binding,
    pub assigned_peer_id: Option<Uuid>,
}

pub async fn create_binding(
    State(state): State<AppState>,
    Json(new): Json<NewBinding>,
) -> Result<(StatusCode, Json<BindingResponse>), (StatusCode, Json<ErrorResponse>)> {
    debug!("creating binding: {:?}", new);
    validate(&new)?;

    let binding = state.bindings.create(new).await.map_err(internal_error)?;
    metrics::counter!("bridge_api_bindings_created_total").increment(1);

    let response = annotate(&state, binding).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_bindings(
    State(state): State<AppState>,
) -> Result<Json<Vec<BindingResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let bindings = state.bindings.list().await.map_err(internal_error)?;
    let peer_ids = live_peer_ids(&state).await?;

    let responses = bindings
        .into_iter()
        .map(|binding| BindingResponse {
            assigned_peer_id: assignment::owner(&peer_ids, binding.id),
            binding,
        })
        .collect();
    Ok(Json(responses))
}

pub async fn get_binding(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BindingResponse>, (StatusCode, Json<ErrorResponse>)> {
    let binding = match state.bindings.get(id).await {
        Ok(binding) => binding,
        Err(StoreError::NotFound) => return Err(not_found(id)),
        Err(store_error) => return Err(internal_error(store_error)),
    };

    let response = annotate(&state, binding).await?;
    Ok(Json(response))
}

pub async fn delete_binding(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    match state.bindings.delete(id).await {
        Ok(()) => {
            metrics::counter!("bridge_api_bindings_deleted_total").increment(1);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(StoreError::NotFound) => Err(not_found(id)),
        Err(store_error) => Err(internal_error(store_error)),
    }
}

fn validate(new: &NewBinding) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    Url::parse(&new.target).map_err(|_| bad_request("could not parse target url"))?;

    if new.stream.is_empty() {
        return Err(bad_request("stream must not be empty"));
    }
    if new.subject_filter.is_empty() {
        return Err(bad_request("subject_filter must not be empty"));
    }
    if let Some(policy) = &new.batching {
        if policy.max_messages == 0 {
            return Err(bad_request("batching.max_messages must be at least 1"));
        }
        if policy.max_latency.is_zero() {
            return Err(bad_request("batching.max_latency_ms must be at least 1"));
        }
    }
    Ok(())
}

async fn annotate(
    state: &AppState,
    binding: Binding,
) -> Result<BindingResponse, (StatusCode, Json<ErrorResponse>)> {
    let peer_ids = live_peer_ids(state).await?;
    Ok(BindingResponse {
        assigned_peer_id: assignment::owner(&peer_ids, binding.id),
        binding,
    })
}

async fn live_peer_ids(state: &AppState) -> Result<Vec<Uuid>, (StatusCode, Json<ErrorResponse>)> {
    let peers = state.peers.list_live().await.map_err(internal_error)?;
    Ok(peers.iter().map(|peer| peer.id).collect())
}

fn not_found(id: Uuid) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("no binding with id {}", id),
        }),
    )
}

fn bad_request(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_owned(),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<ErrorResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use bridge_common::memory::{MemoryBindingStore, MemoryPeerStore};
    use bridge_common::store::PeerStore;

    use crate::handlers::{add_routes, AppState};

    use super::*;

    fn state() -> AppState {
        AppState {
            peers: Arc::new(MemoryPeerStore::new(Duration::from_secs(30))),
            bindings: Arc::new(MemoryBindingStore::new()),
        }
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    const CREATE_BODY: &str = r#"{
        "target": "https://functions.example.com/resize",
        "stream": "EVENTS",
        "subject_filter": "events.images.>",
        "batching": {"max_messages": 10, "max_latency_ms": 500}
    }"#;

    async fn read_binding(response: axum::response::Response) -> BindingResponse {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn create_get_list_delete_round_trip() {
        let state = state();
        let peer = state.peers.join().await.unwrap();
        let app = add_routes(Router::new(), state);

        let response = app
            .clone()
            .oneshot(post("/api/v1/bindings", CREATE_BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = read_binding(response).await;

        // The only live peer owns every binding.
        assert_eq!(created.assigned_peer_id, Some(peer.id));
        assert_eq!(
            created.assigned_peer_id,
            assignment::owner(&[peer.id], created.binding.id)
        );

        let uri = format!("/api/v1/bindings/{}", created.binding.id);
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_binding(response).await, created);

        let response = app.clone().oneshot(get("/api/v1/bindings")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let listed: Vec<BindingResponse> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed, vec![created]);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::DELETE)
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn assignment_matches_rendezvous_choice_across_peers() {
        let state = state();
        let mut peer_ids = Vec::new();
        for _ in 0..5 {
            peer_ids.push(state.peers.join().await.unwrap().id);
        }
        let app = add_routes(Router::new(), state);

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(post("/api/v1/bindings", CREATE_BODY))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            let created = read_binding(response).await;
            assert_eq!(
                created.assigned_peer_id,
                assignment::owner(&peer_ids, created.binding.id)
            );
        }
    }

    #[tokio::test]
    async fn no_live_peers_means_no_assignment() {
        let app = add_routes(Router::new(), state());

        let response = app
            .oneshot(post("/api/v1/bindings", CREATE_BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(read_binding(response).await.assigned_peer_id, None);
    }

    #[tokio::test]
    async fn invalid_bindings_are_rejected() {
        let app = add_routes(Router::new(), state());

        let invalid_payloads = vec![
            // Unparseable target.
            r#"{"target": "not-a-url", "stream": "S", "subject_filter": "a.b", "batching": null}"#,
            // Empty stream.
            r#"{"target": "https://t.example.com", "stream": "", "subject_filter": "a.b", "batching": null}"#,
            // Empty subject filter.
            r#"{"target": "https://t.example.com", "stream": "S", "subject_filter": "", "batching": null}"#,
            // Zero-message batches.
            r#"{"target": "https://t.example.com", "stream": "S", "subject_filter": "a.b", "batching": {"max_messages": 0, "max_latency_ms": 500}}"#,
            // Zero-latency batches.
            r#"{"target": "https://t.example.com", "stream": "S", "subject_filter": "a.b", "batching": {"max_messages": 5, "max_latency_ms": 0}}"#,
        ];

        for payload in invalid_payloads {
            let response = app
                .clone()
                .oneshot(post("/api/v1/bindings", payload))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{payload}");
        }
    }

    #[tokio::test]
    async fn missing_fields_are_unprocessable() {
        let app = add_routes(Router::new(), state());

        let response = app.oneshot(post("/api/v1/bindings", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_binding_is_not_found() {
        let app = add_routes(Router::new(), state());

        let uri = format!("/api/v1/bindings/{}", Uuid::new_v4());
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::DELETE)
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
