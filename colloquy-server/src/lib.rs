//! HTTP routes for the Colloquy chat pipeline
//!
//! # Endpoints
//!
//! - POST /chat - Handle one chat message
//! - GET /sessions/:id/history - Ordered session history
//! - DELETE /sessions/:id - Forget a session
//! - GET /health - Circuit and storage health
//! - POST /feedback - Record feedback on a reply
//! - GET /feedback/analytics - Feedback summary
//! - GET /feedback/session/:id - A session's feedback, newest first
//! - GET /feedback/reviews - Negative feedback queued for review
//!
//! Every error body is `{"error": "..."}`, including malformed JSON.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use colloquy_core::prelude::*;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
    pub feedback: Arc<FeedbackLog>,
}

impl AppState {
    pub fn new(pipeline: Arc<ChatPipeline>, feedback: Arc<FeedbackLog>) -> Self {
        Self { pipeline, feedback }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/sessions/:id/history", get(history_handler))
        .route("/sessions/:id", delete(reset_handler))
        .route("/health", get(health_handler))
        .route("/feedback", post(feedback_handler))
        .route("/feedback/analytics", get(analytics_handler))
        .route("/feedback/session/:id", get(session_feedback_handler))
        .route("/feedback/reviews", get(reviews_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    session_id: String,
    removed: bool,
}

fn error_response(error: ColloquyError) -> Response {
    let status = match &error {
        ColloquyError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => {
            tracing::error!(error = %error, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

fn rejection_response(rejection: JsonRejection) -> Response {
    tracing::debug!(error = %rejection.body_text(), "Rejected request body");
    (
        rejection.status(),
        Json(json!({"error": rejection.body_text()})),
    )
        .into_response()
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Json<ChatResponse>, Response> {
    let Json(request) = payload.map_err(rejection_response)?;
    state
        .pipeline
        .handle(request)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn history_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Vec<HistoryEntry>> {
    Json(state.pipeline.history(&session_id).await)
}

async fn reset_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<ResetResponse> {
    let removed = state.pipeline.reset(&session_id).await;
    tracing::info!(session_id = %session_id, removed, "Session reset");
    Json(ResetResponse {
        session_id,
        removed,
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.pipeline.health().await)
}

async fn feedback_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<FeedbackRequest>, JsonRejection>,
) -> std::result::Result<Json<FeedbackRecord>, Response> {
    let Json(request) = payload.map_err(rejection_response)?;
    state
        .feedback
        .record(request)
        .map(Json)
        .map_err(error_response)
}

async fn analytics_handler(State(state): State<AppState>) -> Json<FeedbackAnalytics> {
    Json(state.feedback.analytics())
}

async fn session_feedback_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Vec<FeedbackRecord>> {
    Json(state.feedback.for_session(&session_id))
}

async fn reviews_handler(State(state): State<AppState>) -> Json<Vec<ReviewItem>> {
    Json(state.feedback.pending_reviews())
}
