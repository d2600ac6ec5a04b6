use crate::{callrecord::CallRecord, correlation::CallCorrelator, repository::Repository};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

#[derive(Clone)]
pub struct ConsoleState {
    pub repository: Arc<dyn Repository>,
    pub correlator: Arc<CallCorrelator>,
}

pub fn router(state: ConsoleState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/calls", get(calls_handler))
        .route("/api/calls/active", get(active_calls_handler))
        .route("/api/sessions/{session_id}/calls", get(session_calls_handler))
        .with_state(state)
        .layer(cors)
}

async fn health_handler() -> &'static str {
    "OK"
}

fn items(records: Vec<CallRecord>) -> Response {
    Json(json!({
        "status": "success",
        "total": records.len(),
        "items": records,
    }))
    .into_response()
}

fn failure(e: anyhow::Error) -> Response {
    warn!(error = %e, "console query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": "error",
            "message": e.to_string(),
        })),
    )
        .into_response()
}

/// `?call_id=a,b`
async fn calls_handler(
    State(state): State<ConsoleState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let call_ids: Vec<String> = params
        .get("call_id")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if call_ids.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "call_id is required",
            })),
        )
            .into_response();
    }
    match state.repository.get_call_records_by_call_ids(&call_ids).await {
        Ok(records) => items(records),
        Err(e) => failure(e),
    }
}

async fn session_calls_handler(
    State(state): State<ConsoleState>,
    Path(session_id): Path<String>,
) -> Response {
    let call_ids = match state.repository.get_call_ids_by_session_id(&session_id).await {
        Ok(ids) => ids,
        Err(e) => return failure(e),
    };
    if call_ids.is_empty() {
        return items(Vec::new());
    }
    match state.repository.get_call_records_by_call_ids(&call_ids).await {
        Ok(records) => items(records),
        Err(e) => failure(e),
    }
}

async fn active_calls_handler(State(state): State<ConsoleState>) -> Response {
    items(state.correlator.active_calls())
}
