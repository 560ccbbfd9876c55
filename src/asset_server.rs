//! Host side of the plugin asset server: URL building and the sidecar
//! process handle.
//!
//! The server itself lives in the `ouroboros-asset-server` crate and runs as
//! a separate process on a fixed loopback port. It is started once at launch,
//! killed at shutdown, and not restarted if it dies.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

pub const ASSET_SERVER_BIN: &str = "ouroboros-asset-server";

/// Builds browser-loadable URLs for files inside plugin folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUrls {
    base: Url,
}

impl AssetUrls {
    /// URLs for the asset server on `127.0.0.1:<port>`.
    pub fn new(port: u16) -> Self {
        let base = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .unwrap_or_else(|_| unreachable!("loopback URL with numeric port always parses"));
        Self { base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `http://127.0.0.1:<port>/<folder>/<relative>`.
    ///
    /// `folder` is one segment; `relative` is split on `/` and `\`. Each
    /// segment is percent-encoded on its own so a separator inside a name can
    /// never collide with a real path boundary.
    pub fn url_for(&self, folder: &str, relative: &str) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(folder);
            for part in relative
                .split(['/', '\\'])
                .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            {
                segments.push(part);
            }
        }
        url.into()
    }
}

/// Path of the sidecar binary: next to our own executable when present,
/// otherwise the bare name for PATH lookup.
pub fn locate_binary() -> PathBuf {
    let file = format!("{ASSET_SERVER_BIN}{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(file))
}

/// Running asset server child process.
pub struct AssetServerProcess {
    kill_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AssetServerProcess {
    /// Spawn `ouroboros-asset-server <root> --port <port>`.
    pub fn spawn(root: &Path, port: u16) -> std::io::Result<Self> {
        Self::spawn_program(
            locate_binary().as_os_str(),
            [
                root.as_os_str().to_owned(),
                "--port".into(),
                port.to_string().into(),
            ],
        )
    }

    pub(crate) fn spawn_program(
        program: &std::ffi::OsStr,
        args: impl IntoIterator<Item = OsString>,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(pid = ?child.id(), "asset server started");

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    // Not restarted: plugin URLs stop resolving until the next launch
                    Ok(status) => tracing::error!(%status, "asset server exited"),
                    Err(e) => tracing::error!("asset server wait failed: {e}"),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("failed to kill asset server: {e}");
                    } else {
                        tracing::info!("asset server stopped");
                    }
                }
            }
        });

        Ok(Self {
            kill_tx: Some(kill_tx),
            task: Some(task),
        })
    }

    /// True until the child exits or is stopped.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Kill the child and wait for it to be reaped.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn url_for_joins_folder_and_path() {
        let urls = AssetUrls::new(3000);
        assert_eq!(
            urls.url_for("viewer", "dist/index.html"),
            "http://127.0.0.1:3000/viewer/dist/index.html"
        );
        assert_eq!(
            urls.url_for("viewer", "./icon.svg"),
            "http://127.0.0.1:3000/viewer/icon.svg"
        );
    }

    #[test]
    fn url_for_encodes_each_segment() {
        let urls = AssetUrls::new(3000);
        assert_eq!(
            urls.url_for("my plugin", "a b/c#d.html"),
            "http://127.0.0.1:3000/my%20plugin/a%20b/c%23d.html"
        );
        assert_eq!(
            urls.url_for("50%", "x?.html"),
            "http://127.0.0.1:3000/50%25/x%3F.html"
        );
    }

    #[test]
    fn distinct_pairs_give_distinct_urls() {
        let urls = AssetUrls::new(3000);
        let pairs = [
            ("a", "b/c.html"),
            ("a/b", "c.html"),
            ("a b", "c.html"),
            ("a%20b", "c.html"),
            ("a", "b%2Fc.html"),
            ("a", "b c.html"),
        ];
        let mut seen = std::collections::HashSet::new();
        for (folder, rel) in pairs {
            assert!(seen.insert(urls.url_for(folder, rel)), "collision for {folder}/{rel}");
        }
    }

    #[tokio::test]
    async fn url_round_trips_through_asset_server() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("my plugin").join("sub dir");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index #1.html"), "<p>hello</p>").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = ouroboros_asset_server::router(root.path().to_path_buf());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let url = AssetUrls::new(port).url_for("my plugin", "sub dir/index #1.html");
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "<p>hello</p>");
    }

    #[test]
    fn locate_binary_falls_back_to_name() {
        let path = locate_binary();
        assert!(path.to_string_lossy().contains(ASSET_SERVER_BIN));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_running_child() {
        let mut proc = AssetServerProcess::spawn_program("sleep".as_ref(), ["30".into()]).unwrap();
        assert!(proc.is_running());
        tokio::time::timeout(Duration::from_secs(5), proc.stop())
            .await
            .expect("stop should not hang");
        assert!(!proc.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_is_not_running() {
        let mut proc = AssetServerProcess::spawn_program("true".as_ref(), std::iter::empty()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!proc.is_running());
        proc.stop().await;
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let result =
            AssetServerProcess::spawn_program("no-such-asset-server".as_ref(), std::iter::empty());
        assert!(result.is_err());
    }
}
