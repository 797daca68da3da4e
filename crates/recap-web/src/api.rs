//! REST endpoint handlers over a shared [`ContextCache`].

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use recap::ContextRequest;
use recap::coordinator::{CacheStats, ContextCache};
use recap::error::ContextError;
use serde::Serialize;

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ContextCache>,
}

/// JSON body returned for every failed request.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

/// [`ContextError`] wrapped for conversion into an HTTP response.
pub struct ApiError(pub ContextError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            ContextError::InvalidWindow { .. } => StatusCode::BAD_REQUEST,
            ContextError::Fetch(_) | ContextError::Summarization(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// POST /api/conversations/{id}/context: Current context, refreshed if due.
///
/// Returns 200 with `{messages, context}`, 502 when a collaborator fails and
/// 400 for an unusable `window_count`. Failures leave the cached entry as it
/// was, so the caller may simply retry.
pub async fn post_context(
    State(app): State<AppState>,
    Path(conversation_id): Path<i64>,
    Json(body): Json<ContextRequest>,
) -> Result<Response, ApiError> {
    let reply = app
        .cache
        .get_context(conversation_id, &body)
        .await
        .map_err(ApiError)?;
    Ok(Json(reply).into_response())
}

/// GET /api/conversations/{id}/context: The stored entry, or 404.
///
/// Read-only: the refresh counter does not move.
pub async fn get_context(
    State(app): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> Response {
    match app.cache.peek(conversation_id) {
        Some(entry) => Json(entry).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// DELETE /api/conversations/{id}/context: Drop the entry. Always 204.
pub async fn delete_context(
    State(app): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> StatusCode {
    app.cache.invalidate(conversation_id).await;
    StatusCode::NO_CONTENT
}

/// GET /api/stats: Cache activity counters.
pub async fn get_stats(State(app): State<AppState>) -> Json<CacheStats> {
    Json(app.cache.stats())
}
