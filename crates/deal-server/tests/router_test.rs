use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use deal_core::{EngineConfig, StageEmitter, StageInput};
use deal_flow::{FlowEngine, StageExecutors};
use deal_protocol::{WorkflowId, WorkflowPhase, WorkflowSnapshot};
use deal_server::{create_router, AppState};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn echo(input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value> {
    emitter.emit(format!("{} draft", input.stage));
    Ok(json!({ "stage": input.stage, "attempt": input.attempt, "feedback": input.feedback }))
}

fn app() -> Router {
    let config = EngineConfig {
        poll_interval_ms: 10,
        ..EngineConfig::default()
    };
    let engine = FlowEngine::new(StageExecutors::uniform(Arc::new(echo)), config);
    create_router(AppState::new(engine))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(body) => Body::from(body.to_string()),
        None => Body::empty(),
    };
    send_body(app, method, uri, body).await
}

async fn send_body(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn start(app: &Router) -> WorkflowId {
    let (status, body) = send(
        app,
        "POST",
        "/api/workflows",
        Some(json!({ "context": { "company_name": "Bizzi", "website": "https://bizzi.vn" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    serde_json::from_value(body["workflow_id"].clone()).expect("workflow id")
}

async fn wait_for_phase(app: &Router, id: WorkflowId, phase: WorkflowPhase) -> WorkflowSnapshot {
    for _ in 0..200 {
        let (status, body) = send(app, "GET", &format!("/api/workflows/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: WorkflowSnapshot = serde_json::from_value(body).expect("snapshot");
        if snapshot.phase == phase {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {id} never reached {phase:?}");
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(&app(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_review_cycle_over_http() {
    let app = app();
    let id = start(&app).await;

    let snapshot = wait_for_phase(&app, id, WorkflowPhase::AwaitingReview).await;
    assert_eq!(snapshot.current_stage, Some(deal_protocol::StageName::RiskScan));

    let (status, output) = send(&app, "GET", &format!("/api/workflows/{id}/outputs/risk_scan"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output["attempt"], 1);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/workflows/{id}/refine"),
        Some(json!({ "stage": "risk_scan", "feedback": "add churn" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_phase(&app, id, WorkflowPhase::AwaitingReview).await;
    let (_, output) = send(&app, "GET", &format!("/api/workflows/{id}/outputs/risk_scan"), None).await;
    assert_eq!(output["attempt"], 2);
    assert_eq!(output["feedback"], "add churn");

    let (status, _) = send(&app, "POST", &format!("/api/workflows/{id}/continue"), None).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_phase(&app, id, WorkflowPhase::AwaitingReview).await;

    let (status, _) = send(&app, "POST", &format!("/api/workflows/{id}/continue"), None).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_phase(&app, id, WorkflowPhase::Completed).await;

    let (status, outputs) = send(&app, "GET", &format!("/api/workflows/{id}/outputs"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outputs["memo"]["stage"], "memo");
    assert_eq!(outputs["risk_scan"]["attempt"], 2);

    let (status, list) = send(&app, "GET", "/api/workflows", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    // Finished workflows reject further review decisions
    let (status, body) = send(&app, "POST", &format!("/api/workflows/{id}/continue"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["workflow_id"], json!(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_stream_of_finished_workflow_ends() {
    let app = app();
    let id = start(&app).await;
    for _ in 0..2 {
        wait_for_phase(&app, id, WorkflowPhase::AwaitingReview).await;
        send(&app, "POST", &format!("/api/workflows/{id}/continue"), None).await;
    }
    wait_for_phase(&app, id, WorkflowPhase::Completed).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/workflows/{id}/events"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().expect("header"),
        "text/event-stream"
    );

    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream ends")
    .expect("body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: status"));
    assert!(text.contains("event: step_complete"));
    assert!(text.contains("event: completed"));
    assert!(!text.contains("event: chunk"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_then_control_is_rejected() {
    let app = app();
    let id = start(&app).await;
    wait_for_phase(&app, id, WorkflowPhase::AwaitingReview).await;

    let (status, body) = send(&app, "POST", &format!("/api/workflows/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (status, _) = send(&app, "POST", &format!("/api/workflows/{id}/continue"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_error_responses() {
    let app = app();

    let missing = WorkflowId::new();
    let (status, body) = send(&app, "GET", &format!("/api/workflows/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["workflow_id"], json!(missing));

    let (status, _) = send(&app, "GET", "/api/workflows/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        "/api/workflows",
        Some(json!({ "context": { "company_name": "  " } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let id = start(&app).await;
    let (status, _) = send(&app, "GET", &format!("/api/workflows/{id}/outputs/nonsense"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/workflows/{id}/refine"),
        Some(json!({ "stage": "risk_scan", "feedback": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("feedback")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_bodies() {
    let app = app();
    let id = start(&app).await;
    wait_for_phase(&app, id, WorkflowPhase::AwaitingReview).await;

    let (status, body) = send_body(
        &app,
        "POST",
        &format!("/api/workflows/{id}/refine"),
        Body::from("{\"stage\": \"risk_scan\""),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/workflows/{id}/skip"),
        Some(json!({ "stage": "valuation" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("valuation")));

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/workflows/{id}/refine"),
        Some(json!({ "stage": "risk_scan", "feedback": " " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["workflow_id"], json!(id));
    assert_eq!(body["stage"], "risk_scan");

    // Stage aliases work in bodies as they do in paths
    let (status, snapshot) = send(
        &app,
        "POST",
        &format!("/api/workflows/{id}/skip"),
        Some(json!({ "stage": "riskScan" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["stage_status"]["risk_scan"], "skipped");
}
