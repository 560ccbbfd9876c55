//! HTTP endpoints for the in-memory log ring buffer.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;
use crate::app_logger::LogEntry;

#[derive(Deserialize)]
pub(super) struct GetLogsQuery {
    #[serde(default)]
    limit: usize,
    /// "trace", "debug", "info", "warn" or "error"
    #[serde(default)]
    level: Option<String>,
    /// Module target, e.g. "ouroboros_lib::lifecycle"
    #[serde(default)]
    source: Option<String>,
}

/// GET /logs?limit=n
pub(super) async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GetLogsQuery>,
) -> Json<Vec<LogEntry>> {
    let mut entries = state.log_buffer.lock().get_entries(q.limit);
    if let Some(level) = &q.level {
        entries.retain(|e| e.level.eq_ignore_ascii_case(level));
    }
    if let Some(source) = &q.source {
        entries.retain(|e| e.source.starts_with(source.as_str()));
    }
    Json(entries)
}

/// DELETE /logs
pub(super) async fn clear_logs(State(state): State<Arc<AppState>>) -> StatusCode {
    state.log_buffer.lock().clear();
    StatusCode::NO_CONTENT
}
