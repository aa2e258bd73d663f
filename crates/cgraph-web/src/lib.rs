//! JSON API over predictions, comparisons and profile similarity.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cgraph_core::CoreError;
use cgraph_graph::similar_profiles;
use cgraph_storage::Store;
use cgraph_sync::{compare_users, predict_for_user, Notifier};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cgraph-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PredictionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompareRequest {
    user_a: Uuid,
    user_b: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SimilarQuery {
    k: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/users/{user_id}/predictions",
            get(latest_predictions_handler).post(run_predictions_handler),
        )
        .route("/comparisons", post(create_comparison_handler))
        .route("/comparisons/{session_id}/results", get(comparison_results_handler))
        .route("/profiles/{profile_id}/similar", get(similar_profiles_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving contact graph api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("CGRAPH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn latest_predictions_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<Uuid>,
    Query(query): Query<PredictionsQuery>,
) -> Response {
    match state.store.latest_predictions(user_id).await {
        Ok(mut predictions) => {
            if let Some(limit) = query.limit {
                predictions.truncate(limit);
            }
            Json(predictions).into_response()
        }
        Err(err) => core_error(&err.into()),
    }
}

async fn run_predictions_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<Uuid>,
) -> Response {
    match predict_for_user(state.store.as_ref(), user_id).await {
        Ok(predictions) => (StatusCode::CREATED, Json(predictions)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn create_comparison_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompareRequest>,
) -> Response {
    match compare_users(
        state.store.as_ref(),
        state.notifier.as_ref(),
        request.user_a,
        request.user_b,
    )
    .await
    {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn comparison_results_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<Uuid>,
) -> Response {
    let session = match state.store.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return core_error(&CoreError::NotFound(format!("session {session_id}"))),
        Err(err) => return core_error(&err.into()),
    };
    match state.store.results_for_session(session_id).await {
        Ok(results) => Json(json!({ "session": session, "results": results })).into_response(),
        Err(err) => core_error(&err.into()),
    }
}

async fn similar_profiles_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(profile_id): AxumPath<Uuid>,
    Query(query): Query<SimilarQuery>,
) -> Response {
    let node_key = match state.store.node_for_profile(profile_id).await {
        Ok(Some(key)) => key,
        Ok(None) => return core_error(&CoreError::NotFound(format!("node for profile {profile_id}"))),
        Err(err) => return core_error(&err.into()),
    };
    match similar_profiles(state.store.as_ref(), &node_key, query.k.unwrap_or(10)).await {
        Ok(similar) => Json(similar).into_response(),
        Err(err) => core_error(&err),
    }
}

fn core_error(err: &CoreError) -> Response {
    let status = match err {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Validation { .. } | CoreError::MalformedInput { .. } => StatusCode::BAD_REQUEST,
        CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        CoreError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        CoreError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    match err.downcast_ref::<CoreError>() {
        Some(core) => core_error(core),
        None => {
            warn!(error = %format!("{err:#}"), "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{err:#}") })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cgraph_core::{Connection, Profile};
    use cgraph_storage::MemoryStore;
    use cgraph_sync::TracingNotifier;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn seeded() -> (AppState, Uuid, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let mut shared = Profile::new("Shared Contact", "https://x/shared", now);
        shared.tags = vec!["source:connection".into()];
        let shared = store.upsert_profile(&shared).await.unwrap();
        let only_a = store
            .upsert_profile(&Profile::new("Only A", "https://x/only-a", now))
            .await
            .unwrap();
        let rows = [(a, shared.id), (b, shared.id), (a, only_a.id)]
            .into_iter()
            .map(|(user_id, profile_id)| Connection {
                user_id,
                profile_id,
                connected_on: now,
                created_at: now,
            })
            .collect::<Vec<_>>();
        store.upsert_connections(&rows).await.unwrap();
        (AppState::new(store, Arc::new(TracingNotifier)), a, b)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (state, _, _) = seeded().await;
        let resp = app(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn predictions_run_then_list() {
        let (state, _, b) = seeded().await;
        let app = app(state);
        let uri = format!("/users/{b}/predictions");
        let created = app
            .clone()
            .oneshot(Request::builder().method("POST").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(body_json(created).await.as_array().unwrap().len(), 1);

        let listed = app
            .oneshot(
                Request::builder()
                    .uri(format!("{uri}?limit=5"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let predictions = body_json(listed).await;
        assert_eq!(predictions.as_array().unwrap().len(), 1);
        assert_eq!(predictions[0]["user_id"], b.to_string());
    }

    #[tokio::test]
    async fn comparison_round_trip_over_http() {
        let (state, a, b) = seeded().await;
        let app = app(state);
        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/comparisons")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "user_a": a, "user_b": b }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let outcome = body_json(created).await;
        assert_eq!(outcome["session"]["status"], "completed");
        let session_id = outcome["session"]["id"].as_str().unwrap().to_string();

        let results = app
            .oneshot(
                Request::builder()
                    .uri(format!("/comparisons/{session_id}/results"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(results.status(), StatusCode::OK);
        let payload = body_json(results).await;
        let types = payload["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["match_type"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert!(types.contains(&"mutual_connection".to_string()));
    }

    #[tokio::test]
    async fn self_comparison_is_a_bad_request() {
        let (state, a, _) = seeded().await;
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/comparisons")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "user_a": a, "user_b": a }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (state, _, _) = seeded().await;
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/comparisons/{}/results", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
