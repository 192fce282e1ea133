//! Request handlers

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{FromRequest, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use deal_protocol::{
    EventEnvelope, RefineRequest, SkipRequest, StageName, StageOutputs, StartRequest, WorkflowId,
    WorkflowSnapshot, WorkflowSummary,
};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy"
    pub status: &'static str,
    /// Server time
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Response to a start request
#[derive(Debug, Serialize)]
pub struct StartResponse {
    /// New workflow
    pub workflow_id: WorkflowId,
    /// State right after the first stage was launched
    pub status: WorkflowSnapshot,
}

/// JSON body whose rejections surface as [`ApiError::BadRequest`]
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

fn parse_id(raw: &str) -> ApiResult<WorkflowId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid workflow ID: {}", raw)))
}

fn parse_stage(raw: &str) -> ApiResult<StageName> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("{}", e)))
}

/// Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now(),
    })
}

/// Start a workflow
pub async fn start_workflow(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<StartRequest>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let workflow_id = state.engine.start(request).await?;
    let status = state.engine.status(workflow_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            workflow_id,
            status,
        }),
    ))
}

/// List every workflow, oldest first
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowSummary>> {
    Json(state.engine.list().await)
}

/// Current snapshot
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowSnapshot>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.status(id).await?))
}

/// Every stored stage output
pub async fn get_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StageOutputs>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.outputs(id).await?))
}

/// One stage output
pub async fn get_output(
    State(state): State<AppState>,
    Path((id, stage)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    let stage = parse_stage(&stage)?;
    Ok(Json(state.engine.output(id, stage).await?))
}

/// Accept the current stage
pub async fn continue_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowSnapshot>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.continue_workflow(id).await?))
}

/// Rerun the current stage with feedback
pub async fn refine_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<RefineRequest>,
) -> ApiResult<Json<WorkflowSnapshot>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state
            .engine
            .refine(id, request.stage, request.feedback)
            .await?,
    ))
}

/// Bypass the current stage
pub async fn skip_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<SkipRequest>,
) -> ApiResult<Json<WorkflowSnapshot>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.skip(id, request.stage).await?))
}

/// Cancel the workflow
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowSnapshot>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.cancel(id).await?))
}

fn to_sse(envelope: EventEnvelope) -> Event {
    let event = Event::default()
        .event(envelope.event.name())
        .id(envelope.seq.to_string());
    match serde_json::to_string(&envelope) {
        Ok(json) => event.data(json),
        Err(e) => {
            tracing::warn!("Dropping unserializable event: {}", e);
            Event::default().comment("unserializable event")
        }
    }
}

/// Stream a workflow's events via SSE
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = parse_id(&id)?;
    let subscription = state.engine.subscribe(id).await?;
    let stream = subscription
        .into_stream()
        .map(|envelope| Ok::<_, Infallible>(to_sse(envelope)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
