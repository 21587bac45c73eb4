mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use common::{minute, Harness};
use facilitywatch::alerting::{AlertLifecycleManager, BroadcastSink};
use facilitywatch::api::{create_router, AppState, TENANT_HEADER, USER_HEADER};
use facilitywatch::config::AlertingConfig;

struct TestApp {
    router: Router,
    harness: Harness,
}

impl TestApp {
    fn new() -> Self {
        let harness = Harness::new();
        let broadcast = Arc::new(BroadcastSink::new(16));
        let manager = Arc::new(AlertLifecycleManager::with_store(
            harness.store.clone(),
            broadcast.clone(),
            AlertingConfig::default(),
        ));

        Self {
            router: create_router(AppState { manager, broadcast }),
            harness,
        }
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header(TENANT_HEADER, self.harness.tenant.to_string())
            .header(USER_HEADER, self.harness.user.to_string());

        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_alert(&self) -> String {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/v1/alerts",
                Some(json!({
                    "asset_id": self.harness.chiller.asset_id,
                    "title": "Refrigerant leak suspected",
                    "severity": "critical",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_tenant_header_is_rejected() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/alerts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rule_crud() {
    let app = TestApp::new();

    let (status, created) = app
        .send(
            Method::POST,
            "/api/v1/alert-rules",
            Some(json!({
                "asset_id": app.harness.chiller.asset_id,
                "sensor_type": "temperature",
                "condition": "between",
                "threshold_value": 40.0,
                "threshold_value_2": 55.0,
                "severity": "low",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["condition"], "between");
    assert_eq!(created["duration_minutes"], 15);
    assert_eq!(created["enabled"], true);

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = app
        .send(Method::GET, &format!("/api/v1/alert-rules/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    let (status, toggled) = app
        .send(
            Method::PATCH,
            &format!("/api/v1/alert-rules/{id}"),
            Some(json!({ "enabled": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["enabled"], false);

    let (status, replaced) = app
        .send(
            Method::PUT,
            &format!("/api/v1/alert-rules/{id}"),
            Some(json!({ "threshold_value": 35.0, "severity": "medium" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replaced["id"], created["id"]);
    assert_eq!(replaced["threshold_value"], 35.0);
    assert_eq!(replaced["threshold_value_2"], 55.0);
    assert_eq!(replaced["severity"], "medium");
    assert_eq!(replaced["enabled"], false);

    let (status, listed) = app.send(Method::GET, "/api/v1/alert-rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/alert-rules/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .send(Method::GET, &format!("/api/v1/alert-rules/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/alert-rules/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rule_update_with_inverted_range_is_bad_request() {
    let app = TestApp::new();
    let (_, created) = app
        .send(
            Method::POST,
            "/api/v1/alert-rules",
            Some(json!({
                "sensor_type": "temperature",
                "condition": "between",
                "threshold_value": 40.0,
                "threshold_value_2": 55.0,
            })),
        )
        .await;
    let id = created["id"].as_str().unwrap();

    let (status, _) = app
        .send(
            Method::PUT,
            &format!("/api/v1/alert-rules/{id}"),
            Some(json!({ "threshold_value": 60.0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, fetched) = app
        .send(Method::GET, &format!("/api/v1/alert-rules/{id}"), None)
        .await;
    assert_eq!(fetched["threshold_value"], 40.0);
}

#[tokio::test]
async fn test_invalid_rule_is_bad_request() {
    let app = TestApp::new();

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/alert-rules",
            Some(json!({
                "sensor_type": "temperature",
                "condition": "between",
                "threshold_value": 40.0,
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Validation error"));
}

#[tokio::test]
async fn test_unknown_alert_is_not_found() {
    let app = TestApp::new();
    let (status, _) = app
        .send(
            Method::GET,
            &format!("/api/v1/alerts/{}", Uuid::new_v4()),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_alert_workflow() {
    let app = TestApp::new();
    let id = app.create_alert().await;

    let (status, body) = app
        .send(Method::POST, &format!("/api/v1/alerts/{id}/close"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Cannot move alert from open to closed");

    let (status, acked) = app
        .send(
            Method::POST,
            &format!("/api/v1/alerts/{id}/acknowledge"),
            Some(json!({ "note": "Isolating circuit" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["status"], "acknowledged");
    assert_eq!(acked["acknowledged_by"], app.harness.user.to_string());

    let (status, spawned) = app
        .send(
            Method::POST,
            &format!("/api/v1/alerts/{id}/work-orders"),
            Some(json!({ "priority": "high" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(spawned["alert"]["status"], "in_progress");
    assert_eq!(spawned["work_order"]["type"], "reactive");
    assert_eq!(spawned["work_order"]["priority"], "high");

    let (status, resolved) = app
        .send(
            Method::POST,
            &format!("/api/v1/alerts/{id}/resolve"),
            Some(json!({ "resolution_notes": "Brazed joint repaired" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "resolved");

    let (status, detail) = app
        .send(Method::GET, &format!("/api/v1/alerts/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "resolved");
    assert_eq!(detail["acknowledgments"].as_array().map(Vec::len), Some(1));
    assert_eq!(detail["work_orders"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_list_alerts_filters_by_status() {
    let app = TestApp::new();
    let first = app.create_alert().await;
    app.create_alert().await;
    app.send(
        Method::POST,
        &format!("/api/v1/alerts/{first}/resolve"),
        None,
    )
    .await;

    let (status, open) = app
        .send(Method::GET, "/api/v1/alerts?status=open", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(open["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(open["total"], 1);

    let (_, page) = app
        .send(Method::GET, "/api/v1/alerts?limit=1&offset=1", None)
        .await;
    assert_eq!(page["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(page["total"], 2);
    assert_eq!(page["offset"], 1);
}

#[tokio::test]
async fn test_list_alerts_searches_titles() {
    let app = TestApp::new();
    app.create_alert().await;

    let (status, hits) = app
        .send(Method::GET, "/api/v1/alerts?search=refrigerant", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hits["total"], 1);

    let (_, misses) = app
        .send(Method::GET, "/api/v1/alerts?search=compressor", None)
        .await;
    assert_eq!(misses["total"], 0);
    assert_eq!(misses["items"], json!([]));
}

#[tokio::test]
async fn test_evaluate_endpoint_runs_cycle() {
    let app = TestApp::new();
    app.send(
        Method::POST,
        "/api/v1/alert-rules",
        Some(json!({
            "asset_id": app.harness.chiller.asset_id,
            "sensor_type": "temperature",
            "condition": "gt",
            "threshold_value": 80.0,
            "duration_minutes": 0,
        })),
    )
    .await;
    // The endpoint evaluates at the current time; a reading in the past is in force
    app.harness
        .store
        .add_reading(app.harness.chiller.id, 92.0, minute(0));

    let (status, report) = app.send(Method::POST, "/api/v1/alerts/evaluate", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["rules_evaluated"], 1);
    assert_eq!(report["alerts_created"], 1);
}
