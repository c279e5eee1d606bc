//! Control API integration tests

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use tower::ServiceExt;
use venue_voice::session::SessionState;

mod common;
use common::{Harness, eventually};

async fn call(app: axum::Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::spawn();
    let app = venue_voice::api::router(h.session.clone());

    let (status, json) = call(app, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_session_status_starts_idle() {
    let h = Harness::spawn();
    let app = venue_voice::api::router(h.session.clone());

    let (status, json) = call(app, Method::GET, "/session").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "idle");
    assert_eq!(json["degraded"], false);
    assert!(json["advisory"].is_null());
    assert!(json["error"].is_null());
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop() {
    let h = Harness::spawn();
    let app = venue_voice::api::router(h.session.clone());

    let (status, _) = call(app.clone(), Method::POST, "/session/start").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let session = h.session.clone();
    eventually(|| session.status().state == SessionState::WakeListening).await;
    let (_, json) = call(app.clone(), Method::GET, "/session").await;
    assert_eq!(json["state"], "wake_listening");

    let (status, _) = call(app.clone(), Method::POST, "/session/stop").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    eventually(|| session.status().state == SessionState::Idle).await;
    assert!(!h.recognizer.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_wake_outside_active_is_ignored() {
    let h = Harness::spawn();
    let app = venue_voice::api::router(h.session.clone());

    let (status, _) = call(app, Method::POST, "/session/wake").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.session.status().state, SessionState::Idle);
}

#[tokio::test]
async fn test_commands_after_shutdown_fail() {
    let h = Harness::spawn();
    h.session.shutdown().unwrap();
    h.task.await.unwrap();

    let app = venue_voice::api::router(h.session.clone());
    let (status, json) = call(app, Method::POST, "/session/start").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["code"], "session_closed");
    assert!(json["error"]["message"].is_string());
}

#[tokio::test]
async fn test_unknown_route() {
    let h = Harness::spawn();
    let app = venue_voice::api::router(h.session.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
