//! HTTP error mapping

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use deal_core::{EngineError, ErrorKind};
use deal_protocol::{StageName, WorkflowId};
use serde::Serialize;

/// Result alias for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message
    pub error: String,
    /// Workflow the error concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    /// Stage the error concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
}

/// Handler error
#[derive(Debug)]
pub enum ApiError {
    /// Engine rejected the operation
    Engine(EngineError),
    /// Malformed path or body
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Precondition => StatusCode::CONFLICT,
                ErrorKind::Invalid => StatusCode::BAD_REQUEST,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest(message) => ErrorBody {
                error: message.clone(),
                workflow_id: None,
                stage: None,
            },
            ApiError::Engine(e) => ErrorBody {
                error: e.to_string(),
                workflow_id: e.workflow_id(),
                stage: e.stage(),
            },
        };

        if status.is_server_error() {
            tracing::error!(status = %status, "{}", body.error);
        } else {
            tracing::debug!(status = %status, "{}", body.error);
        }

        (status, Json(body)).into_response()
    }
}
