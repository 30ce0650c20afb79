//! Health check endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/providers", get(providers))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.control.ready().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}

/// Last health check result per provider.
async fn providers(State(state): State<AppState>) -> Json<Value> {
    let providers = state.health.snapshot().await;
    let healthy = providers.iter().filter(|p| p.healthy).count();
    Json(json!({
        "healthy": healthy,
        "total": providers.len(),
        "providers": providers,
    }))
}
