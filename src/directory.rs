//! The host's selected working directory.
//!
//! Selecting a directory lists it as a node tree, broadcasts the listing to
//! every plugin iframe, and keeps a recursive watcher on it so later changes
//! are re-broadcast.

use crate::broker::{Broker, IFrameMessage};
use crate::watcher::{self, DirWatcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// How deep `list_tree` descends below the selected directory.
pub const MAX_TREE_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

/// One level of a folder, as parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderContents {
    pub files: Vec<String>,
    pub is_folder: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub directory_path: String,
    pub directory_name: String,
    pub nodes: Vec<FileNode>,
}

impl DirectoryListing {
    pub fn to_message(&self) -> IFrameMessage {
        IFrameMessage::SendDirectoryContents {
            directory_path: Some(self.directory_path.clone()),
            directory_name: Some(self.directory_name.clone()),
            nodes: self.nodes.clone(),
        }
    }
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// List `folder` one level deep, hidden entries skipped. Unreadable
/// folders give an empty result.
pub fn fetch_folder_contents(folder: &Path) -> FolderContents {
    let Ok(entries) = std::fs::read_dir(folder) else {
        return FolderContents::default();
    };

    let mut rows: Vec<(String, bool)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                return None;
            }
            // Follows symlinks, like a stat
            let is_folder = entry.path().is_dir();
            Some((name, is_folder))
        })
        .collect();
    rows.sort();

    let (files, is_folder) = rows.into_iter().unzip();
    FolderContents { files, is_folder }
}

/// Recursive listing of `root`, folders and files sorted by name.
pub fn list_tree(root: &Path, max_depth: usize) -> Vec<FileNode> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut nodes: Vec<FileNode> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                return None;
            }
            let path = entry.path();
            let is_folder = path.is_dir();
            let children = (is_folder && max_depth > 0).then(|| list_tree(&path, max_depth - 1));
            Some(FileNode {
                name,
                path: path.to_string_lossy().to_string(),
                is_folder,
                children,
            })
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes
}

fn build_listing(path: &Path) -> DirectoryListing {
    DirectoryListing {
        directory_path: path.to_string_lossy().to_string(),
        directory_name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string()),
        nodes: list_tree(path, MAX_TREE_DEPTH),
    }
}

/// The selected listing, tagged with the selection that produced it.
#[derive(Default)]
struct Selection {
    /// Bumped by every `select`; listings from older selections are dropped.
    generation: AtomicU64,
    listing: RwLock<Option<DirectoryListing>>,
}

impl Selection {
    /// Broadcast and store `listing` unless a newer selection has started.
    fn publish(&self, broker: &Broker, generation: u64, listing: DirectoryListing) -> bool {
        let mut current = self.listing.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(path = %listing.directory_path, "stale directory listing dropped");
            return false;
        }
        broker.broadcast(&listing.to_message());
        *current = Some(listing);
        true
    }
}

pub struct DirectorySession {
    broker: Arc<Broker>,
    selection: Arc<Selection>,
    watcher: Mutex<Option<DirWatcher>>,
}

impl DirectorySession {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            selection: Arc::new(Selection::default()),
            watcher: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<DirectoryListing> {
        self.selection.listing.read().clone()
    }

    /// Make `path` the selected directory.
    pub async fn select(&self, path: PathBuf) -> std::io::Result<DirectoryListing> {
        if !tokio::fs::metadata(&path).await?.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", path.display()),
            ));
        }

        // Retire the old watcher before anything of the new selection is
        // published; a batch it still delivers carries a stale generation
        drop(self.watcher.lock().take());
        let generation = self.selection.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let listing = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || build_listing(&path))
                .await
                .map_err(std::io::Error::other)?
        };
        if !self.selection.publish(&self.broker, generation, listing.clone()) {
            return Ok(listing);
        }

        let broker = self.broker.clone();
        let selection = self.selection.clone();
        let watched = path.clone();
        let new_watcher = watcher::watch(&path, true, watcher::DEFAULT_DEBOUNCE, move |changed| {
            let visible = changed.iter().any(|p| !touches_hidden(&watched, p));
            if visible {
                selection.publish(&broker, generation, build_listing(&watched));
            }
        });
        match new_watcher {
            // A newer select may have raced in while the watcher was set up
            Ok(w) if self.selection.generation.load(Ordering::SeqCst) == generation => {
                *self.watcher.lock() = Some(w);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), "directory will not auto-refresh: {e}");
            }
        }

        tracing::info!(path = %path.display(), "directory selected");
        Ok(listing)
    }
}

/// True when any component of `changed` below `root` is hidden.
fn touches_hidden(root: &Path, changed: &Path) -> bool {
    match changed.strip_prefix(root) {
        Ok(relative) => relative
            .components()
            .any(|c| is_hidden(&c.as_os_str().to_string_lossy())),
        // Watchers may report canonical paths that no longer share the prefix
        Err(_) => changed
            .file_name()
            .is_some_and(|n| is_hidden(&n.to_string_lossy())),
    }
}
