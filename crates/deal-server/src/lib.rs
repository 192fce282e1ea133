//! Deal Server - REST and server-sent event surface for [`FlowEngine`]
//!
//! | method | path | operation |
//! |---|---|---|
//! | GET | `/health` | liveness |
//! | POST | `/api/workflows` | start |
//! | GET | `/api/workflows` | list |
//! | GET | `/api/workflows/:id` | status |
//! | GET | `/api/workflows/:id/events` | subscribe (SSE) |
//! | GET | `/api/workflows/:id/outputs` | all outputs |
//! | GET | `/api/workflows/:id/outputs/:stage` | one output |
//! | POST | `/api/workflows/:id/continue` | continue |
//! | POST | `/api/workflows/:id/refine` | refine |
//! | POST | `/api/workflows/:id/skip` | skip |
//! | POST | `/api/workflows/:id/cancel` | cancel |

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

use axum::{
    routing::{get, post},
    Router,
};
use deal_flow::FlowEngine;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
pub mod handlers;

pub use error::{ApiError, ApiResult};

/// Shared application state
#[derive(Debug, Clone)]
pub struct AppState {
    /// The workflow engine
    pub engine: FlowEngine,
}

impl AppState {
    /// Wrap an engine
    pub fn new(engine: FlowEngine) -> Self {
        Self { engine }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let workflow_routes = Router::new()
        .route(
            "/workflows",
            get(handlers::list_workflows).post(handlers::start_workflow),
        )
        .route("/workflows/:id", get(handlers::get_status))
        .route("/workflows/:id/events", get(handlers::stream_events))
        .route("/workflows/:id/outputs", get(handlers::get_outputs))
        .route("/workflows/:id/outputs/:stage", get(handlers::get_output))
        .route("/workflows/:id/continue", post(handlers::continue_workflow))
        .route("/workflows/:id/refine", post(handlers::refine_stage))
        .route("/workflows/:id/skip", post(handlers::skip_stage))
        .route("/workflows/:id/cancel", post(handlers::cancel_workflow));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", workflow_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
///
/// Workflows live in memory only and are gone once this returns.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Deal Co-Pilot API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
