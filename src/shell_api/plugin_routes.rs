use axum::Json;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::{ApiError, ApiResult};
use crate::AppState;
use crate::install::InstallError;
use crate::lifecycle::{PluginDetail, ServiceStatus};
use crate::registry::{self, PluginListing};

impl From<InstallError> for ApiError {
    fn from(e: InstallError) -> Self {
        let status = match &e {
            InstallError::InvalidUrl(_)
            | InstallError::InvalidFolder(_)
            | InstallError::Descriptor(_)
            | InstallError::TargetInsideSource { .. } => StatusCode::BAD_REQUEST,
            InstallError::NotInstalled(_) => StatusCode::NOT_FOUND,
            InstallError::Cancelled => StatusCode::CONFLICT,
            InstallError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            InstallError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            InstallError::Http(_)
            | InstallError::Status { .. }
            | InstallError::NoArchive
            | InstallError::Archive(_) => StatusCode::BAD_GATEWAY,
            InstallError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

/// GET /plugins/paths
pub(super) async fn plugin_paths(State(state): State<Arc<AppState>>) -> Json<Vec<PluginDetail>> {
    Json(state.lifecycle.details().to_vec())
}

/// GET /plugins/folder-contents; also starts the folder watcher.
pub(super) async fn folder_contents(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<PluginListing>>> {
    state.watch_plugins_folder();
    let root = state.lifecycle.plugins_dir().clone();
    let rows = tokio::task::spawn_blocking(move || registry::list_folder_contents(&root))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
pub(super) struct DownloadBody {
    url: String,
}

/// POST /plugins/download
pub(super) async fn download(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DownloadBody>,
) -> ApiResult<Json<PluginListing>> {
    let installed = state.installer.download_plugin(&body.url).await?;
    Ok(Json(PluginListing::from(&installed)))
}

#[derive(Deserialize)]
pub(super) struct LocalBody {
    path: PathBuf,
}

/// POST /plugins/local
pub(super) async fn add_local(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LocalBody>,
) -> ApiResult<Json<PluginListing>> {
    let installed = state.installer.add_local_plugin(body.path).await?;
    Ok(Json(PluginListing::from(&installed)))
}

/// DELETE /plugins/{folder}
pub(super) async fn delete(
    State(state): State<Arc<AppState>>,
    AxumPath(folder): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.installer.delete_plugin(&folder).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /plugins/cancel-install
pub(super) async fn cancel_install(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"cancelled": state.installer.cancel_install()}))
}

/// GET /plugins/services
pub(super) async fn services(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceStatus>> {
    Json(state.lifecycle.service_states())
}
