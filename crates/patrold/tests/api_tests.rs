//! Integration tests for the daemon API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use patrol_lib::health::components;
use patrol_lib::{HealthRegistry, PatrolEngineBuilder, PatrolMetrics};
use std::sync::Arc;
use tower::ServiceExt;

#[path = "../src/api.rs"]
mod api;

async fn setup_test_app() -> (axum::Router, Arc<api::AppState>) {
    let health = HealthRegistry::new();
    health.set_ok(components::ENGINE).await;
    health.set_ok(components::TRIGGERS).await;

    let engine = PatrolEngineBuilder::new().build();
    let state = Arc::new(api::AppState::new(health, engine));
    let router = api::create_router(state.clone());

    (router, state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "ok");
    assert!(health["components"]["engine"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health
        .set_degraded(components::PERSISTENCE, "save failing")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Degraded is still operational
    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_failed() {
    let (app, state) = setup_test_app().await;

    state
        .health
        .set_failed(components::ENGINE, "no state provider")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let health = body_json(response).await;
    assert_eq!(health["status"], "failed");
}

#[tokio::test]
async fn test_readyz_reflects_readiness() {
    let (app, state) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.health.set_ready(true).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_status_reports_engine_state() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["runs_completed"], 0);
    assert_eq!(status["in_flight"], false);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    // Touch a few series so they are present in the exposition
    let metrics = PatrolMetrics::new();
    metrics.inc_run("tick", "scheduled");
    metrics.observe_triage_flags(2);
    metrics.inc_finding_rejected("vm", "disk");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("patrol_run_total"));
    assert!(text.contains("patrol_triage_flags_bucket"));
    assert!(text.contains("patrol_finding_rejected_total"));
}
