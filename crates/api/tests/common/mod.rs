#![allow(dead_code)]

use std::sync::Arc;

use atelier_api::auth::jwt::{mint_user_token, JwtConfig};
use atelier_api::build_app;
use atelier_api::config::ServerConfig;
use atelier_api::middleware::auth::WORKER_TOKEN_HEADER;
use atelier_api::state::AppState;
use atelier_core::coverage::{Coverage, WorkerCapabilities};
use atelier_core::generation::ModelType;
use atelier_core::types::DbId;
use atelier_db::store::{MemoryRequestStore, RequestStore};
use atelier_pipeline::coverage_index::CoverageIndex;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

pub const WORKER_TOKEN: &str = "test-worker-token";
pub const OWNER: DbId = 1;
pub const OTHER_USER: DbId = 2;
pub const MODERATOR: DbId = 3;
pub const CHECKPOINT_ID: DbId = 101;
pub const LORA_ID: DbId = 202;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        jwt: JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hs256".to_string(),
            leeway_secs: 30,
        },
        worker_token: WORKER_TOKEN.to_string(),
        database_url: None,
        coverage_url: None,
        coverage_refresh_secs: 30,
        dispatch_queue_capacity: 100,
        secs_per_image_step: 0.15,
    }
}

/// One provider serving the checkpoint and LoRA used by [`submission`].
pub fn covered_fleet() -> Coverage {
    Coverage::from_workers(&[WorkerCapabilities {
        worker_id: "w1".to_string(),
        service_provider: "alpha".to_string(),
        assets: vec![CHECKPOINT_ID, LORA_ID],
        asset_types: vec![ModelType::Checkpoint, ModelType::Lora],
        schedulers: vec!["Euler a".to_string()],
    }])
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryRequestStore>,
}

/// Build the full application over an in-memory store, mirroring `main.rs`.
pub fn build_test_app() -> TestApp {
    build_test_app_with(covered_fleet())
}

pub fn build_test_app_with(coverage: Coverage) -> TestApp {
    let store = Arc::new(MemoryRequestStore::new());
    let state = AppState::assemble(
        test_config(),
        Arc::clone(&store) as Arc<dyn RequestStore>,
        Arc::new(CoverageIndex::new(coverage)),
        None,
    );
    TestApp {
        router: build_app(state.clone()),
        state,
        store,
    }
}

pub fn token_for(user_id: DbId, role: &str) -> String {
    mint_user_token(user_id, role, chrono::Duration::minutes(15), &test_config().jwt)
        .expect("token should encode")
}

pub fn user_token(user_id: DbId) -> String {
    token_for(user_id, "user")
}

pub fn submission() -> Value {
    json!({
        "resources": [
            { "id": CHECKPOINT_ID, "model_type": "Checkpoint" },
            { "id": LORA_ID, "model_type": "LORA", "strength": 0.8 }
        ],
        "prompt": "a lighthouse at dusk",
        "width": 512,
        "height": 512,
        "sampler": "Euler a",
        "steps": 20,
        "cfg_scale": 7.0,
        "quantity": 1
    })
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.expect("router is infallible")
}

fn builder(method: Method, uri: &str, token: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri);
    match token {
        Some(token) => builder.header("authorization", format!("Bearer {token}")),
        None => builder,
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, builder(Method::GET, uri, None).body(Body::empty()).unwrap()).await
}

pub async fn get_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    send(
        app,
        builder(Method::GET, uri, Some(token))
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

pub async fn post_json_auth(app: Router, uri: &str, body: Value, token: &str) -> Response<Body> {
    send(
        app,
        builder(Method::POST, uri, Some(token))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

/// POST an arbitrary body with the given content type.
pub async fn post_raw_auth(
    app: Router,
    uri: &str,
    content_type: &str,
    body: &str,
    token: &str,
) -> Response<Body> {
    send(
        app,
        builder(Method::POST, uri, Some(token))
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

pub async fn post_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    send(
        app,
        builder(Method::POST, uri, Some(token))
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

pub async fn delete_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    send(
        app,
        builder(Method::DELETE, uri, Some(token))
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

/// Call a worker route with the shared worker token.
pub async fn worker_call(
    app: Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> Response<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(WORKER_TOKEN_HEADER, WORKER_TOKEN);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    };
    send(app, request.unwrap()).await
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Create a request as `user_id` and return its JSON `data`.
pub async fn create_request(app: &Router, user_id: DbId) -> Value {
    let response = post_json_auth(
        app.clone(),
        "/api/v1/generation/requests",
        submission(),
        &user_token(user_id),
    )
    .await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    body_json(response).await["data"].clone()
}
