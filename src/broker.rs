//! Host <-> plugin iframe message broker.
//!
//! Plugins talk to the host with `{type, data}` messages. Every inbound
//! message goes through the same gate: origin allow-list, envelope shape,
//! then a typed payload for one of the inbound variants. Anything that fails
//! a step is dropped; nothing is ever thrown back at the plugin.

use crate::directory::FileNode;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Every message that crosses the iframe boundary, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum IFrameMessage {
    #[serde(rename_all = "camelCase")]
    RegisterPlugin { plugin_name: String },
    #[serde(rename_all = "camelCase")]
    ReadFile { folder: String, file_name: String },
    #[serde(rename_all = "camelCase")]
    ReadFileResponse { file_name: String, contents: String },
    #[serde(rename_all = "camelCase")]
    SaveFile {
        folder: String,
        file_name: String,
        contents: String,
    },
    #[serde(rename_all = "camelCase")]
    SendDirectoryContents {
        directory_path: Option<String>,
        directory_name: Option<String>,
        nodes: Vec<FileNode>,
    },
}

/// Types a plugin may send to the host.
const INBOUND_TYPES: [&str; 3] = ["register-plugin", "read-file", "save-file"];

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("message source is closed")]
    Closed,
    #[error("{0} is outside the allowed directories")]
    OutsideRoots(PathBuf),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where replies and broadcasts are delivered. One per connected iframe.
pub trait MessageSource: Send + Sync {
    fn post(&self, message: &IFrameMessage) -> Result<(), BrokerError>;
}

/// A source backed by a channel, drained by whatever transport carries the
/// iframe (the WebSocket bridge, or a test).
pub struct ChannelSource {
    tx: mpsc::UnboundedSender<IFrameMessage>,
}

impl ChannelSource {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<IFrameMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl MessageSource for ChannelSource {
    fn post(&self, message: &IFrameMessage) -> Result<(), BrokerError> {
        self.tx.send(message.clone()).map_err(|_| BrokerError::Closed)
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    RejectedOrigin,
    Malformed,
    Ignored,
    Registered(String),
    FileSent(PathBuf),
    FileSaved(PathBuf),
    Failed,
}

/// True when `origin` is one of `allowed`, optionally followed by a port or
/// path. `http://localhost.evil.com` does not match `http://localhost`.
pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|prefix| {
        origin
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(':') || rest.starts_with('/'))
    })
}

pub struct Broker {
    allowed_origins: Vec<String>,
    fs_roots: Vec<PathBuf>,
    iframes: DashMap<String, Arc<dyn MessageSource>>,
    /// Last directory listing, replayed to plugins that register later.
    latest_directory: parking_lot::RwLock<Option<IFrameMessage>>,
}

impl Broker {
    pub fn new(allowed_origins: Vec<String>, fs_roots: Vec<PathBuf>) -> Self {
        Self {
            allowed_origins,
            fs_roots,
            iframes: DashMap::new(),
            latest_directory: parking_lot::RwLock::new(None),
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        origin_allowed(&self.allowed_origins, origin)
    }

    pub fn registered_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.iframes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Validate and dispatch one message from `source`.
    pub async fn handle(
        &self,
        origin: &str,
        source: Arc<dyn MessageSource>,
        raw: serde_json::Value,
    ) -> Outcome {
        if !self.origin_allowed(origin) {
            tracing::debug!(%origin, "message from untrusted origin dropped");
            return Outcome::RejectedOrigin;
        }

        let envelope: Envelope = match serde_json::from_value(raw.clone()) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("malformed iframe message: {e}");
                return Outcome::Malformed;
            }
        };
        if !envelope.data.is_object() {
            tracing::debug!(kind = %envelope.kind, "iframe message data is not an object");
            return Outcome::Malformed;
        }
        if !INBOUND_TYPES.contains(&envelope.kind.as_str()) {
            return Outcome::Ignored;
        }

        let message: IFrameMessage = match serde_json::from_value(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(kind = %envelope.kind, "iframe payload rejected: {e}");
                return Outcome::Malformed;
            }
        };

        match message {
            IFrameMessage::RegisterPlugin { plugin_name } => self.register(plugin_name, source),
            IFrameMessage::ReadFile { folder, file_name } => {
                self.read_file(&folder, &file_name, source.as_ref()).await
            }
            IFrameMessage::SaveFile {
                folder,
                file_name,
                contents,
            } => self.save_file(&folder, &file_name, &contents).await,
            IFrameMessage::ReadFileResponse { .. } | IFrameMessage::SendDirectoryContents { .. } => {
                Outcome::Ignored
            }
        }
    }

    /// Post `message` to every registered iframe. Dead sources are skipped.
    pub fn broadcast(&self, message: &IFrameMessage) {
        // A listing holds the lock through the fan-out, so a registration
        // sees either the previous listing followed by this one, or this one.
        let _latest = matches!(message, IFrameMessage::SendDirectoryContents { .. }).then(|| {
            let mut latest = self.latest_directory.write();
            *latest = Some(message.clone());
            latest
        });
        for entry in self.iframes.iter() {
            if let Err(e) = entry.value().post(message) {
                tracing::trace!(plugin = %entry.key(), "broadcast skipped: {e}");
            }
        }
    }

    fn register(&self, plugin_name: String, source: Arc<dyn MessageSource>) -> Outcome {
        tracing::info!(plugin = %plugin_name, "iframe registered");
        let latest = self.latest_directory.read();
        self.iframes.insert(plugin_name.clone(), source.clone());
        if let Some(listing) = latest.as_ref() {
            let _ = source.post(listing);
        }
        Outcome::Registered(plugin_name)
    }

    async fn read_file(&self, folder: &str, file_name: &str, source: &dyn MessageSource) -> Outcome {
        let path = match self.resolve(folder, file_name) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("read-file refused: {e}");
                return Outcome::Failed;
            }
        };

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), "read-file failed: {e}");
                return Outcome::Failed;
            }
        };

        let reply = IFrameMessage::ReadFileResponse {
            file_name: file_name.to_string(),
            contents,
        };
        match source.post(&reply) {
            Ok(()) => Outcome::FileSent(path),
            Err(e) => {
                tracing::debug!("read-file reply dropped: {e}");
                Outcome::Failed
            }
        }
    }

    async fn save_file(&self, folder: &str, file_name: &str, contents: &str) -> Outcome {
        let path = match self.resolve(folder, file_name) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("save-file refused: {e}");
                return Outcome::Failed;
            }
        };

        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, contents).await
        }
        .await;

        match result {
            Ok(()) => Outcome::FileSaved(path),
            Err(source) => {
                let e = BrokerError::Io { path, source };
                tracing::warn!("save-file failed: {e}");
                Outcome::Failed
            }
        }
    }

    /// Join `folder/file_name`, enforcing the configured roots if any.
    fn resolve(&self, folder: &str, file_name: &str) -> Result<PathBuf, BrokerError> {
        let path = Path::new(folder).join(file_name);
        if self.fs_roots.is_empty() {
            return Ok(path);
        }
        let has_parent = path.components().any(|c| matches!(c, Component::ParentDir));
        if !has_parent && self.fs_roots.iter().any(|root| path.starts_with(root)) {
            Ok(path)
        } else {
            Err(BrokerError::OutsideRoots(path))
        }
    }
}
