// src/api.rs
use std::sync::Arc;

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::sync::diagnostics::SyncStatus;
use crate::sync::{PollingOptions, SyncEngine};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/status", get(status))
        .route("/v1/version", get(version))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Convenience alias used by tests and the binary.
pub fn router(engine: Arc<SyncEngine>) -> Router {
    create_router(AppState { engine })
}

#[derive(Serialize)]
struct StatusResp {
    #[serde(flatten)]
    status: SyncStatus,
    #[serde(rename = "pollingOptions")]
    polling_options: PollingOptions,
}

async fn status(State(state): State<AppState>) -> Json<StatusResp> {
    Json(StatusResp {
        status: state.engine.diagnostics(),
        polling_options: state.engine.polling_options(),
    })
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found(method: Method, uri: Uri) -> Response {
    tracing::warn!(target: "sync", %method, %uri, "resource not found");
    if method == Method::HEAD {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = json!({
        "name": "ResourceNotFound",
        "message": "resource not found",
        "method": method.as_str(),
        "statusCode": StatusCode::NOT_FOUND.as_u16(),
        "url": uri.to_string(),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
