use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Serialize)]
pub struct ReadyResponse<'a> {
    status: &'a str,
    cache: &'a str,
}

#[derive(Serialize)]
pub struct DeletedResponse {
    deleted: u64,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "gigcache",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

// The cache is optional, so readiness never depends on it; it is only reported.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ReadyResponse {
            status: "ready",
            cache: state.store.status().as_str(),
        }),
    )
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "metrics recorder not installed"})),
        )
            .into_response(),
    }
}

// ---- Admin invalidation ----

#[derive(Debug, Deserialize)]
pub struct RoleFilter {
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateUsersRequest {
    pub user_ids: Vec<String>,
}

pub async fn invalidate_prefix(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> impl IntoResponse {
    let deleted = state.invalidator.invalidate_all_for_prefix(&prefix).await;
    (StatusCode::OK, Json(DeletedResponse { deleted }))
}

pub async fn invalidate_user(
    State(state): State<AppState>,
    Path((prefix, user_id)): Path<(String, String)>,
    Query(filter): Query<RoleFilter>,
) -> impl IntoResponse {
    let role = filter.role.as_deref().filter(|r| !r.is_empty());
    let deleted = state
        .invalidator
        .invalidate_for_user(&user_id, &prefix, role)
        .await;
    (StatusCode::OK, Json(DeletedResponse { deleted }))
}

pub async fn invalidate_users(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
    Json(request): Json<InvalidateUsersRequest>,
) -> impl IntoResponse {
    let deleted = state
        .invalidator
        .invalidate_for_many(&request.user_ids, &prefix)
        .await;
    (StatusCode::OK, Json(DeletedResponse { deleted }))
}
