//! Loopback HTTP API between the renderer and the host.
//!
//! Request/response routes cover the plugin list, install/remove and the
//! directory session; `GET /events` pushes host events over SSE and
//! `GET /broker` carries iframe messages over a WebSocket.

mod directory_routes;
mod log_routes;
mod plugin_routes;
mod stream_routes;

use crate::AppState;
use crate::broker::origin_allowed;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Origins allowed to call the API from a browser context.
const LOOPBACK_ORIGINS: [&str; 2] = ["http://localhost", "http://127.0.0.1"];

/// Port file path: <config_dir>/shell-port
fn port_file_path() -> std::path::PathBuf {
    crate::config::config_dir().join("shell-port")
}

/// JSON `{ "error": ... }` with a non-2xx status.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({"error": self.message}))).into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// Build the router (exposed for testing).
pub fn build_router(state: Arc<AppState>) -> Router {
    let loopback: Vec<String> = LOOPBACK_ORIGINS.iter().map(|o| o.to_string()).collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin
                .to_str()
                .is_ok_and(|o| origin_allowed(&loopback, o))
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        // Plugins
        .route("/plugins/paths", get(plugin_routes::plugin_paths))
        .route("/plugins/folder-contents", get(plugin_routes::folder_contents))
        .route("/plugins/download", post(plugin_routes::download))
        .route("/plugins/local", post(plugin_routes::add_local))
        .route("/plugins/cancel-install", post(plugin_routes::cancel_install))
        .route("/plugins/services", get(plugin_routes::services))
        .route("/plugins/{folder}", delete(plugin_routes::delete))
        // Directory session
        .route(
            "/directory",
            get(directory_routes::current).post(directory_routes::select),
        )
        // Push channels
        .route("/events", get(stream_routes::events))
        .route("/broker", get(stream_routes::broker_socket))
        // Logs
        .route("/logs", get(log_routes::get_logs).delete(log_routes::clear_logs))
        .with_state(state)
        .layer(cors)
}

/// Bind `127.0.0.1:<shell_api_port>`, publish the bound port in
/// `<config_dir>/shell-port`, and serve until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", state.config.shell_api_port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "shell API listening");

    let port_file = port_file_path();
    if let Some(parent) = port_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&port_file, addr.port().to_string()) {
        tracing::warn!("failed to write port file {}: {e}", port_file.display());
    }

    let app = build_router(state);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown.await.ok();
            })
            .await;

        let _ = std::fs::remove_file(port_file_path());
        if let Err(e) = result {
            tracing::error!("shell API server error: {e}");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_logger::LogRingBuffer;
    use crate::config::AppConfig;
    use crate::github_release::GitHubClient;
    use crate::lifecycle::tests::FakeCompose;
    use crate::registry::tests::write_plugin;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::StreamExt;
    use tower::ServiceExt;

    struct TestApp {
        plugins: tempfile::TempDir,
        fake: Arc<FakeCompose>,
        state: Arc<AppState>,
    }

    fn test_app() -> TestApp {
        let plugins = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCompose::default());
        let config = AppConfig {
            plugins_dir: Some(plugins.path().to_path_buf()),
            ..AppConfig::default()
        };
        let state = Arc::new(AppState::new(
            config,
            fake.clone(),
            GitHubClient::new("http://127.0.0.1:9", None),
            LogRingBuffer::shared(100),
        ));
        TestApp {
            plugins,
            fake,
            state,
        }
    }

    impl TestApp {
        fn router(&self) -> Router {
            build_router(self.state.clone())
        }

        fn add_plugin(&self, folder: &str, id: &str) -> std::path::PathBuf {
            write_plugin(
                self.plugins.path(),
                folder,
                serde_json::json!({"id": id, "displayName": id.to_uppercase(), "entryPoint": "index.html"}),
                &["index.html"],
            )
        }
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let resp = app
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["ok"], true);
    }

    #[tokio::test]
    async fn paths_reflect_last_start_cycle() {
        let app = test_app();
        app.add_plugin("viewer", "viewer");

        let resp = app
            .router()
            .oneshot(Request::get("/plugins/paths").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, serde_json::json!([]));

        app.state.lifecycle.start_all().await;
        let resp = app
            .router()
            .oneshot(Request::get("/plugins/paths").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_json(resp).await,
            serde_json::json!([{
                "id": "viewer",
                "name": "VIEWER",
                "indexPath": "http://127.0.0.1:3000/viewer/index.html"
            }])
        );
    }

    #[tokio::test]
    async fn folder_contents_lists_installed_plugins() {
        let app = test_app();
        app.add_plugin("folder-a", "a");

        let resp = app
            .router()
            .oneshot(Request::get("/plugins/folder-contents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json[0]["id"], "a");
        assert_eq!(json[0]["folderName"], "folder-a");
        assert!(app.state.folder_watcher.lock().is_some());
    }

    #[tokio::test]
    async fn local_install_errors_are_json() {
        let app = test_app();
        let missing = app.plugins.path().join("nowhere");
        let resp = app
            .router()
            .oneshot(json_request(
                Method::POST,
                "/plugins/local",
                serde_json::json!({"path": missing}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("invalid plugin"));
    }

    #[tokio::test]
    async fn local_install_returns_listing() {
        let app = test_app();
        let sources = tempfile::tempdir().unwrap();
        let source = write_plugin(
            sources.path(),
            "checkout",
            serde_json::json!({"id": "viewer", "displayName": "Viewer", "entryPoint": "index.html"}),
            &["index.html"],
        );

        let resp = app
            .router()
            .oneshot(json_request(
                Method::POST,
                "/plugins/local",
                serde_json::json!({"path": source}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["folderName"], "viewer");
        assert_eq!(app.state.lifecycle.details().len(), 1);
    }

    #[tokio::test]
    async fn download_rejects_non_github_url() {
        let app = test_app();
        let resp = app
            .router()
            .oneshot(json_request(
                Method::POST,
                "/plugins/download",
                serde_json::json!({"url": "https://example.com/a/b"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_maps_errors_to_status() {
        let app = test_app();
        let resp = app
            .router()
            .oneshot(Request::delete("/plugins/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .router()
            .oneshot(Request::delete("/plugins/.hidden").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let dir = app.add_plugin("viewer", "viewer");
        let resp = app
            .router()
            .oneshot(Request::delete("/plugins/viewer").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn cancel_without_install_is_noop() {
        let app = test_app();
        let resp = app
            .router()
            .oneshot(json_request(Method::POST, "/plugins/cancel-install", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, serde_json::json!({"cancelled": false}));
    }

    #[tokio::test]
    async fn services_report_compose_state() {
        let app = test_app();
        write_plugin(
            app.plugins.path(),
            "svc",
            serde_json::json!({
                "id": "svc", "displayName": "Svc", "entryPoint": "index.html", "composeFile": "compose.yml"
            }),
            &["index.html", "compose.yml"],
        );
        app.state.lifecycle.stop_all().await;

        let resp = app
            .router()
            .oneshot(Request::get("/plugins/services").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_json(resp).await,
            serde_json::json!([{"folder": "svc", "pluginId": "svc", "state": "down"}])
        );
        assert_eq!(app.fake.downs.lock().len(), 1);
    }

    #[tokio::test]
    async fn directory_select_and_current() {
        let app = test_app();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("a.tif"), "").unwrap();

        let resp = app
            .router()
            .oneshot(Request::get("/directory").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, serde_json::Value::Null);

        let resp = app
            .router()
            .oneshot(json_request(
                Method::POST,
                "/directory",
                serde_json::json!({"path": data.path()}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["nodes"][0]["name"], "a.tif");

        let resp = app
            .router()
            .oneshot(json_request(
                Method::POST,
                "/directory",
                serde_json::json!({"path": data.path().join("missing")}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_honor_limit_and_level() {
        let app = test_app();
        {
            let mut buf = app.state.log_buffer.lock();
            buf.push("info".into(), "ouroboros_lib::lifecycle".into(), "one".into(), None);
            buf.push("error".into(), "ouroboros_lib::compose".into(), "two".into(), None);
            buf.push("info".into(), "ouroboros_lib::lifecycle".into(), "three".into(), None);
        }

        let resp = app
            .router()
            .oneshot(Request::get("/logs?limit=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["message"], "two");

        let resp = app
            .router()
            .oneshot(Request::get("/logs?level=error").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["source"], "ouroboros_lib::compose");
    }

    #[tokio::test]
    async fn events_stream_starts_with_plugin_paths() {
        let app = test_app();
        let resp = app
            .router()
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let mut body = resp.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: plugin-paths"), "{text}");
    }

    #[tokio::test]
    async fn cors_allows_loopback_only() {
        let app = test_app();
        let preflight = |origin: &str| {
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/plugins/paths")
                .header("origin", origin)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.router().oneshot(preflight("http://localhost:5173")).await.unwrap();
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );

        let resp = app.router().oneshot(preflight("http://localhost.evil.com")).await.unwrap();
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn broker_socket_answers_read_file() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};

        let app = test_app();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("notes.txt"), "hello").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let mut request = format!("ws://{addr}/broker").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", "http://127.0.0.1:3000".parse().unwrap());
        let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let read = serde_json::json!({
            "type": "read-file",
            "data": {"folder": data.path(), "fileName": "notes.txt"}
        });
        socket
            .send(Message::Text(read.to_string().into()))
            .await
            .unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "read-file-response",
                "data": {"fileName": "notes.txt", "contents": "hello"}
            })
        );
    }
}
