pub mod app_logger;
pub mod asset_server;
pub mod broker;
pub(crate) mod cli;
pub mod compose;
pub mod config;
pub mod directory;
pub mod events;
pub mod github_release;
pub mod install;
pub mod lifecycle;
pub mod main_server;
pub mod manifest;
pub mod registry;
pub mod shell_api;
pub(crate) mod state;
pub mod watcher;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use state::AppState;

/// How long shutdown waits for open shell API connections to drain.
const SERVER_DRAIN: Duration = Duration::from_secs(3);

/// Command-line overrides applied on top of `config.json`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub plugins_dir: Option<PathBuf>,
    pub asset_server_port: Option<u16>,
    pub shell_api_port: Option<u16>,
    /// Do not spawn the asset server sidecar (one is already running).
    pub no_asset_server: bool,
    /// Do not run the compute server's Compose project.
    pub no_main_server: bool,
}

impl RunOptions {
    pub fn apply(&self, config: &mut config::AppConfig) {
        if let Some(dir) = &self.plugins_dir {
            config.plugins_dir = Some(dir.clone());
        }
        if let Some(port) = self.asset_server_port {
            config.asset_server_port = port;
        }
        if let Some(port) = self.shell_api_port {
            config.shell_api_port = port;
        }
        if self.no_main_server {
            config.main_server.enabled = false;
        }
    }
}

/// Resolve on Ctrl-C, or on SIGTERM where there is one (`docker stop`,
/// service managers).
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.map(|()| "interrupt"),
            _ = terminate.recv() => Ok("terminate"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|()| "interrupt")
    }
}

/// Run the host until Ctrl-C or SIGTERM.
///
/// Startup order: logging, config, plugins directory (the only fatal step),
/// asset server, compute server, plugin start cycle, shell API. Shutdown
/// reverses it and waits for every Compose project to come down.
pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    let log_buffer = app_logger::init_logging();

    let mut config = config::load_app_config();
    options.apply(&mut config);

    let plugins_dir = config::ensure_plugins_dir(&config).with_context(|| {
        format!(
            "failed to create plugins directory {}",
            config.plugins_dir().display()
        )
    })?;
    tracing::info!(path = %plugins_dir.display(), "plugins directory ready");

    let compose: Arc<dyn compose::ComposeManager> = Arc::new(compose::DockerCompose::new(
        Duration::from_secs(config.compose_timeout_secs),
    ));

    let github_token = github_release::resolve_github_token();
    if github_token.is_none() {
        tracing::debug!("no GitHub token found (checked GH_TOKEN, GITHUB_TOKEN, gh CLI); using anonymous API access");
    }
    let github = github_release::GitHubClient::new(&config.github_api_base, github_token);

    let mut asset_server = if options.no_asset_server {
        None
    } else {
        match asset_server::AssetServerProcess::spawn(&plugins_dir, config.asset_server_port) {
            Ok(process) => Some(process),
            Err(e) => {
                tracing::error!("failed to start asset server: {e}");
                None
            }
        }
    };

    let main_server = main_server::MainServer::from_config(&config.main_server, compose.clone());
    if let Some(server) = &main_server {
        server.start();
    }

    let state = Arc::new(AppState::new(config, compose, github, log_buffer));
    state.lifecycle.start_all().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let api = shell_api::start_server(state.clone(), shutdown_rx)
        .await
        .context("failed to start shell API")?;

    let signal = shutdown_signal()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!(signal, "shutting down");

    let _ = shutdown_tx.send(());
    state.lifecycle.shutdown().await;
    if let Some(server) = &main_server {
        server.stop().await;
    }
    if let Some(process) = asset_server.as_mut() {
        process.stop().await;
    }
    if tokio::time::timeout(SERVER_DRAIN, api).await.is_err() {
        tracing::warn!("shell API connections still open at exit");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_override_config() {
        let mut config = config::AppConfig::default();
        RunOptions {
            plugins_dir: Some(PathBuf::from("/tmp/plugins")),
            asset_server_port: Some(4100),
            shell_api_port: Some(4200),
            no_asset_server: true,
            no_main_server: true,
        }
        .apply(&mut config);

        assert_eq!(config.plugins_dir(), PathBuf::from("/tmp/plugins"));
        assert_eq!(config.asset_server_port, 4100);
        assert_eq!(config.shell_api_port, 4200);
        assert!(!config.main_server.enabled);
    }

    #[test]
    fn empty_options_keep_config() {
        let mut config = config::AppConfig::default();
        RunOptions::default().apply(&mut config);
        assert_eq!(config, config::AppConfig::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_resolves_shutdown_signal() {
        let waiting = tokio::spawn(shutdown_signal());
        // Let the handler register before raising
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(signal, "terminate");
    }
}
