use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::{ApiError, ApiResult};
use crate::AppState;
use crate::directory::DirectoryListing;

#[derive(Deserialize)]
pub(super) struct SelectBody {
    path: PathBuf,
}

/// POST /directory: select a working directory and broadcast it.
pub(super) async fn select(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectBody>,
) -> ApiResult<Json<DirectoryListing>> {
    let listing = state.directory.select(body.path).await.map_err(|e| {
        let status = match e.kind() {
            std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        ApiError::new(status, e.to_string())
    })?;
    Ok(Json(listing))
}

/// GET /directory
pub(super) async fn current(State(state): State<Arc<AppState>>) -> Json<Option<DirectoryListing>> {
    Json(state.directory.current())
}
