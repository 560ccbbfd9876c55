//! Shared state behind the shell API.
//!
//! One [`AppState`] is built at startup and handed to every route as an
//! `Arc`. It owns the lifecycle controller, the installer, the broker and
//! the directory session, all wired to the same event bus.

use crate::app_logger::SharedLogBuffer;
use crate::asset_server::AssetUrls;
use crate::broker::Broker;
use crate::compose::ComposeManager;
use crate::config::AppConfig;
use crate::directory::DirectorySession;
use crate::events::{EventBus, ShellEvent};
use crate::github_release::GitHubClient;
use crate::install::Installer;
use crate::lifecycle::Lifecycle;
use crate::registry;
use crate::watcher::{self, DirWatcher};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Everything the shell API handlers reach for.
pub struct AppState {
    pub config: AppConfig,
    pub events: EventBus,
    pub lifecycle: Arc<Lifecycle>,
    pub broker: Arc<Broker>,
    pub directory: DirectorySession,
    pub installer: Installer,
    pub log_buffer: SharedLogBuffer,
    /// Watch on the plugins directory, started by the first
    /// `GET /plugins/folder-contents`.
    pub(crate) folder_watcher: Mutex<Option<DirWatcher>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        compose: Arc<dyn ComposeManager>,
        github: GitHubClient,
        log_buffer: SharedLogBuffer,
    ) -> Self {
        let events = EventBus::new();
        let lifecycle = Arc::new(Lifecycle::new(
            config.plugins_dir(),
            compose,
            AssetUrls::new(config.asset_server_port),
            events.clone(),
        ));
        let broker = Arc::new(Broker::new(
            config.trusted_origins.clone(),
            config.broker_fs_roots.clone(),
        ));
        let installer = Installer::new(
            lifecycle.clone(),
            github,
            events.clone(),
            Duration::from_secs(config.download_timeout_secs),
        );

        Self {
            directory: DirectorySession::new(broker.clone()),
            config,
            events,
            lifecycle,
            broker,
            installer,
            log_buffer,
            folder_watcher: Mutex::new(None),
        }
    }

    /// Start pushing `plugin-folder-contents` whenever the plugins directory
    /// changes. Idempotent.
    pub fn watch_plugins_folder(&self) {
        let mut slot = self.folder_watcher.lock();
        if slot.is_some() {
            return;
        }

        let root = self.lifecycle.plugins_dir().clone();
        let events = self.events.clone();
        let watched = root.clone();
        match watcher::watch(&root, true, watcher::DEFAULT_DEBOUNCE, move |_| {
            events.emit(ShellEvent::PluginFolderContents(registry::list_folder_contents(
                &watched,
            )));
        }) {
            Ok(w) => *slot = Some(w),
            Err(e) => tracing::warn!(path = %root.display(), "cannot watch plugins folder: {e}"),
        }
    }
}
