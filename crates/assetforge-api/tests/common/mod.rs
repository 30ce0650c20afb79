//! Shared helpers for API integration tests.

#![allow(dead_code)]

use assetforge_api::{AppState, routes};
use assetforge_config::SystemConfig;
use assetforge_db::MemoryJobStore;
use assetforge_scheduler::{CancellationRegistry, HealthRegistry, JobControl, ProgressBroadcaster};
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const OWNER: &str = "user-1";

/// State backed by an in-memory store with no workers running, so jobs stay
/// where the test puts them.
pub fn test_state(config: SystemConfig) -> AppState {
    test_state_with_store(config).0
}

/// Like [`test_state`], also handing back the store for direct seeding.
pub fn test_state_with_store(config: SystemConfig) -> (AppState, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let control = JobControl::new(
        Arc::new(config),
        store.clone(),
        broadcaster.clone(),
        Arc::new(CancellationRegistry::new()),
    );
    let health = Arc::new(HealthRegistry::new(
        Duration::from_millis(50),
        Duration::from_secs(30),
    ));
    (AppState::new(control, broadcaster, health), store)
}

pub fn build_test_app() -> Router {
    routes::router(test_state(SystemConfig::default()))
}

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(
        app,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await
}

pub async fn post_json(app: Router, uri: &str, body: &Value) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-user-id", OWNER)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

pub async fn post_empty(app: Router, uri: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn knight() -> Value {
    serde_json::json!({
        "prompt": "knight",
        "assetType": "character-design",
        "width": 512,
        "height": 512,
        "count": 1
    })
}
