use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conductor_core::EngineError;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Serve the API until ctrl-c, then stop live jobs
pub async fn serve(addr: &str, state: AppState) -> Result<()> {
    let orchestrator = state.orchestrator.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    orchestrator.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/workflows",
            post(handlers::create_workflow).get(handlers::list_workflows),
        )
        .route(
            "/workflows/{workflow_id}",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route(
            "/workflows/{workflow_id}/execute",
            post(handlers::execute_workflow),
        )
        .route("/jobs", post(handlers::create_job).get(handlers::list_jobs))
        .route(
            "/jobs/{job_id}",
            get(handlers::get_job).delete(handlers::delete_job),
        )
        .route("/jobs/{job_id}/start", post(handlers::start_job))
        .route("/jobs/{job_id}/execute", post(handlers::execute_job))
        .route("/jobs/{job_id}/stop", post(handlers::stop_job))
        .route("/jobs/{job_id}/cancel", post(handlers::cancel_job))
        .route("/jobs/{job_id}/events", get(handlers::get_job_events))
        .route("/metrics", get(handlers::get_metrics));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "conductor",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Engine error rendered as an HTTP response
pub struct ApiError(EngineError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) | EngineError::InvalidState(_) => StatusCode::CONFLICT,
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
