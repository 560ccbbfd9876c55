//! Host events pushed to the renderer over `GET /events`.

use crate::compose::ComposeState;
use crate::lifecycle::PluginDetail;
use crate::registry::PluginListing;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ShellEvent {
    /// The published plugin list changed.
    PluginPaths(Vec<PluginDetail>),
    /// Rows for the "manage plugins" view.
    PluginFolderContents(Vec<PluginListing>),
    #[serde(rename_all = "camelCase")]
    ServiceState {
        folder: String,
        plugin_id: String,
        state: ComposeState,
    },
    /// Blocking error dialog (e.g. Docker missing).
    Alert { title: String, message: String },
    #[serde(rename_all = "camelCase")]
    InstallFinished {
        operation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ShellEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ShellEvent::PluginPaths(_) => "plugin-paths",
            ShellEvent::PluginFolderContents(_) => "plugin-folder-contents",
            ShellEvent::ServiceState { .. } => "service-state",
            ShellEvent::Alert { .. } => "alert",
            ShellEvent::InstallFinished { .. } => "install-finished",
        }
    }
}

/// Fan-out of [`ShellEvent`]s. Emitting with no subscriber is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: ShellEvent) {
        tracing::trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.tx.subscribe()
    }
}
