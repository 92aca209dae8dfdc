//! Tests for REST API endpoints, driven through the router without a socket.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use stepwise::api::{self, AppState};
use stepwise::catalog::{Catalog, StateMachine};
use stepwise::engine::Scheduler;
use stepwise::engine::scheduler::CANCELLED_MESSAGE;
use stepwise::storage::JobStore;
use stepwise::storage::memory_store::MemoryJobStore;

fn hello_machine() -> StateMachine {
    StateMachine {
        name: "hello".to_string(),
        path: "/machines/hello".into(),
        usage: "usage: hello\n".to_string(),
        states: vec!["start".to_string(), "world".to_string()],
    }
}

fn app_with(credentials: Option<(String, String)>) -> (Router, Scheduler) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let scheduler = Scheduler::new(store);
    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        catalog: Arc::new(Catalog::new(vec![hello_machine()])),
        credentials,
    });
    (api::router(state, 1024), scheduler)
}

fn app() -> (Router, Scheduler) {
    app_with(None)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &'static [u8]) -> Request<Body> {
    Request::post(uri).body(Body::from(body)).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::delete(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_and_usage() {
    let (app, _) = app();

    let (status, body) = send_json(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("POST   /runs/{machine}"));
}

#[tokio::test]
async fn machines_endpoints() {
    let (app, _) = app();

    let (status, body) = send_json(&app, get("/machines")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["name"], "hello");
    assert_eq!(body[0]["states"][1], "world");

    let (status, body) = send_json(&app, get("/machines/hello")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usage"], "usage: hello\n");

    let (status, body) = send_json(&app, get("/machines/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn run_lifecycle_over_http() {
    let (app, scheduler) = app();

    let (status, body) = send_json(&app, post("/runs/hello", b"payload")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);
    assert!(body["message"].as_str().unwrap().contains("hello"));
    assert_eq!(scheduler.get_run(1).await.unwrap().input, b"payload");

    let (status, body) = send_json(&app, get("/runs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert!(body["runs"].is_array(), "runs are wrapped in an envelope");
    assert_eq!(body["runs"][0]["machine"], "hello");
    assert_eq!(body["runs"][0]["next_state"], "start");

    let (status, body) = send_json(&app, get("/runs/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);
    assert_eq!(body["input"], STANDARD.encode(b"payload"));

    let (status, body) = send_json(&app, delete("/runs/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("cancelled"));

    // The cancelled run is still readable, but no longer active.
    let (status, body) = send_json(&app, get("/runs/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["next_state"], "stop");
    assert_eq!(body["status_message"], CANCELLED_MESSAGE);

    let (_, body) = send_json(&app, get("/runs")).await;
    assert_eq!(body["total"], 0);

    let (status, _) = send_json(&app, delete("/runs/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_machine_and_run_are_not_found() {
    let (app, scheduler) = app();

    let (status, _) = send_json(&app, post("/runs/missing", b"")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(scheduler.list_active().is_empty());

    let (status, _) = send_json(&app, get("/runs/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(&app, delete("/runs/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_run_id_is_bad_request() {
    let (app, _) = app();

    let (status, body) = send_json(&app, get("/runs/abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("abc"));

    let (status, _) = send_json(&app, delete("/runs/-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let (app, scheduler) = app();

    let big = vec![b'x'; 4096];
    let request = Request::post("/runs/hello").body(Body::from(big)).unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(scheduler.list_active().is_empty());
}

#[tokio::test]
async fn basic_auth_required_when_configured() {
    let (app, _) = app_with(Some(("admin".to_string(), "secret".to_string())));

    let response = app.clone().oneshot(get("/machines")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"Protected Area\""
    );

    let wrong = Request::get("/machines")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("admin:wrong")),
        )
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let right = Request::get("/machines")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("admin:secret")),
        )
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, right).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "hello");
}
