//! Static file server for installed plugins.
//!
//! Runs as its own process (spawned by the Ouroboros host) so a crash while
//! serving files cannot take the host down. Every request is resolved as
//! `{root}/{plugin_folder}/{relative_path}`; anything that would leave the
//! root is rejected before touching the disk.

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Build the asset router rooted at the plugins directory.
///
/// CORS is open to every origin: plugin iframes are served from this port
/// but the host window lives on another origin.
pub fn router(root: PathBuf) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD]);

    Router::new()
        .route("/{*path}", get(serve_asset))
        .with_state(Arc::new(root))
        .layer(cors)
}

/// Bind `addr` and serve until Ctrl-C / SIGTERM.
pub async fn serve(root: PathBuf, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(root = %root.display(), %local, "plugin asset server listening");

    axum::serve(listener, router(root))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("plugin asset server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn serve_asset(
    State(root): State<Arc<PathBuf>>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    let Some(file_path) = resolve_asset_path(&root, &path) else {
        return (StatusCode::BAD_REQUEST, "Invalid plugin asset path").into_response();
    };

    match tokio::fs::read(&file_path).await {
        Ok(data) => {
            let mime = mime_guess::from_path(&file_path)
                .first_or_octet_stream()
                .to_string();
            (StatusCode::OK, [(header::CONTENT_TYPE, mime)], data).into_response()
        }
        Err(e) => {
            tracing::debug!(path = %file_path.display(), "asset not served: {e}");
            (StatusCode::NOT_FOUND, "Plugin file not found").into_response()
        }
    }
}

/// Returns true if a relative path attempts to escape its root via `..`,
/// absolute components or drive prefixes.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);
    if path.is_absolute() {
        return true;
    }
    path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Map a request path (`{folder}/{file}`) onto the plugins root.
fn resolve_asset_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let (folder, file) = trimmed.split_once('/')?;

    if folder.is_empty() || file.is_empty() {
        return None;
    }
    if is_path_escape(folder) || is_path_escape(file) {
        return None;
    }

    Some(root.join(folder).join(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn plugins_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let plugin = dir.path().join("viewer");
        std::fs::create_dir_all(plugin.join("assets")).unwrap();
        std::fs::write(plugin.join("index.html"), "<html>viewer</html>").unwrap();
        std::fs::write(plugin.join("assets/app.js"), "console.log('hi')").unwrap();
        dir
    }

    async fn get(root: &Path, uri: &str) -> Response {
        router(root.to_path_buf())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn resolve_rejects_traversal() {
        let root = Path::new("/plugins");
        assert!(resolve_asset_path(root, "../etc/passwd").is_none());
        assert!(resolve_asset_path(root, "viewer/../../secret").is_none());
        assert!(resolve_asset_path(root, "viewer//etc/passwd").is_none());
    }

    #[test]
    fn resolve_rejects_empty_segments() {
        let root = Path::new("/plugins");
        assert!(resolve_asset_path(root, "").is_none());
        assert!(resolve_asset_path(root, "viewer").is_none());
        assert!(resolve_asset_path(root, "viewer/").is_none());
        assert!(resolve_asset_path(root, "/index.html").is_none());
    }

    #[test]
    fn resolve_nested_path() {
        let root = Path::new("/plugins");
        let resolved = resolve_asset_path(root, "viewer/assets/app.js").unwrap();
        assert!(resolved.ends_with("viewer/assets/app.js"));
        assert!(resolved.starts_with(root));
    }

    #[tokio::test]
    async fn serves_file_with_content_type() {
        let dir = plugins_root();
        let resp = get(dir.path(), "/viewer/index.html").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(ct.to_str().unwrap().starts_with("text/html"));

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<html>viewer</html>");
    }

    #[tokio::test]
    async fn serves_nested_asset() {
        let dir = plugins_root();
        let resp = get(dir.path(), "/viewer/assets/app.js").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let dir = plugins_root();
        let resp = get(dir.path(), "/viewer/nope.html").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_is_404() {
        let dir = plugins_root();
        let resp = get(dir.path(), "/viewer/assets").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_is_400() {
        let dir = plugins_root();
        let resp = get(dir.path(), "/viewer/../../etc/passwd").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let dir = plugins_root();
        let resp = router(dir.path().to_path_buf())
            .oneshot(
                Request::get("/viewer/index.html")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }
}
