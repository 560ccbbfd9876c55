//! The image-processing compute server, run as a Compose project next to
//! the plugins. Its API is consumed by plugins, not by the host.

use crate::compose::{self, ComposeManager, ComposeProject};
use crate::config::{MainServerConfig, MainServerMode};
use std::sync::Arc;

const COMPOSE_FILE: &str = "compose.yml";

pub struct MainServer {
    compose: Arc<dyn ComposeManager>,
    project: ComposeProject,
    /// Development runs rebuild images from the local checkout.
    build: bool,
}

impl MainServer {
    /// `None` when disabled or when the directory for the configured mode
    /// is not set.
    pub fn from_config(config: &MainServerConfig, compose: Arc<dyn ComposeManager>) -> Option<Self> {
        if !config.enabled {
            tracing::info!("main server disabled");
            return None;
        }
        let (dir, build) = match config.mode {
            MainServerMode::Development => (config.dev_dir.as_ref(), true),
            MainServerMode::Production => (config.prod_dir.as_ref(), false),
        };
        let Some(dir) = dir else {
            tracing::warn!(mode = ?config.mode, "main server directory not configured");
            return None;
        };
        Some(Self {
            compose,
            project: ComposeProject::from_file(dir.join(COMPOSE_FILE)),
            build,
        })
    }

    pub fn project(&self) -> &ComposeProject {
        &self.project
    }

    /// Fire-and-forget start; failures are only logged.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        tracing::info!(file = %self.project.file.display(), build = self.build, "starting main server");
        compose::start_detached(self.compose.clone(), self.project.clone(), self.build, |e| {
            tracing::error!("main server failed to start: {e}");
        })
    }

    pub async fn stop(&self) {
        match self.compose.down(&self.project).await {
            Ok(()) => tracing::info!("main server stopped"),
            Err(e) => tracing::error!("failed to stop main server: {e}"),
        }
    }
}
