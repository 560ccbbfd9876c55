//! Installed-plugin discovery.
//!
//! Scans the plugins directory one level deep. Every folder that carries a
//! valid manifest whose referenced files exist becomes a `PluginDescriptor`;
//! anything else is logged and skipped. A broken plugin never aborts the scan.

use crate::manifest::{self, LEGACY_MANIFEST_FILE, MANIFEST_FILE, ManifestError, PluginManifest};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Why a single folder was not accepted as a plugin.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("no manifest.json or package.json")]
    MissingManifest,
    #[error("failed to read manifest: {0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("{field} not found: {path}")]
    MissingFile { field: &'static str, path: PathBuf },
}

/// A validated manifest plus where it lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub manifest: PluginManifest,
    /// Absolute path of the plugin folder.
    pub folder: PathBuf,
    /// On-disk directory name; may differ from `manifest.id`.
    pub folder_name: String,
}

impl PluginDescriptor {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn display_name(&self) -> &str {
        &self.manifest.display_name
    }

    /// Absolute path of the declared Compose file, if any.
    pub fn compose_path(&self) -> Option<PathBuf> {
        self.manifest
            .compose_file
            .as_ref()
            .map(|f| self.folder.join(f))
    }
}

/// Row shown in the "manage plugins" window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginListing {
    pub id: String,
    pub name: String,
    pub folder: PathBuf,
    pub folder_name: String,
}

impl From<&PluginDescriptor> for PluginListing {
    fn from(d: &PluginDescriptor) -> Self {
        PluginListing {
            id: d.manifest.id.clone(),
            name: d.manifest.display_name.clone(),
            folder: d.folder.clone(),
            folder_name: d.folder_name.clone(),
        }
    }
}

/// Read and validate the plugin in `folder`, checking that the entry point
/// and Compose file it references exist.
pub fn load_descriptor(folder: &Path) -> Result<PluginDescriptor, DescriptorError> {
    let manifest = read_manifest(folder)?;

    let entry = folder.join(&manifest.entry_point);
    if !entry.is_file() {
        return Err(DescriptorError::MissingFile {
            field: "entryPoint",
            path: entry,
        });
    }

    if let Some(compose) = &manifest.compose_file {
        let compose_path = folder.join(compose);
        if !compose_path.is_file() {
            return Err(DescriptorError::MissingFile {
                field: "composeFile",
                path: compose_path,
            });
        }
    }

    let folder_name = folder
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(PluginDescriptor {
        manifest,
        folder: folder.to_path_buf(),
        folder_name,
    })
}

fn read_manifest(folder: &Path) -> Result<PluginManifest, DescriptorError> {
    let current = folder.join(MANIFEST_FILE);
    if current.is_file() {
        let raw = std::fs::read_to_string(&current)?;
        return Ok(manifest::validate(&raw)?);
    }

    let legacy = folder.join(LEGACY_MANIFEST_FILE);
    if legacy.is_file() {
        let raw = std::fs::read_to_string(&legacy)?;
        return Ok(manifest::validate_legacy(&raw)?);
    }

    Err(DescriptorError::MissingManifest)
}

/// True when `folder` has a manifest file of either format. Does not validate.
pub fn has_manifest(folder: &Path) -> bool {
    folder.join(MANIFEST_FILE).is_file() || folder.join(LEGACY_MANIFEST_FILE).is_file()
}

/// Scan the plugins directory and return every valid plugin.
///
/// Order follows the directory listing and is not guaranteed to be sorted.
pub fn scan(root: &Path) -> Vec<PluginDescriptor> {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(err) => {
            tracing::error!("Failed to read plugins dir {}: {err}", root.display());
            return Vec::new();
        }
    };

    let mut descriptors = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let dir_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        if dir_name.starts_with('.') {
            continue;
        }

        // Folders without any manifest are not plugins; stay quiet about them
        if !has_manifest(&path) {
            continue;
        }

        match load_descriptor(&path) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(err) => tracing::warn!(folder = %dir_name, "skipping plugin: {err}"),
        }
    }

    descriptors
}

/// Rows for the "manage plugins" view.
pub fn list_folder_contents(root: &Path) -> Vec<PluginListing> {
    scan(root).iter().map(PluginListing::from).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a plugin folder with a current-format manifest and its files.
    pub(crate) fn write_plugin(
        root: &Path,
        folder: &str,
        manifest: serde_json::Value,
        files: &[&str],
    ) -> PathBuf {
        let dir = root.join(folder);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        for file in files {
            let path = dir.join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, format!("contents of {file}")).unwrap();
        }
        dir
    }

    fn ids(descriptors: &[PluginDescriptor]) -> Vec<String> {
        let mut ids: Vec<String> = descriptors.iter().map(|d| d.id().to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn scan_keeps_valid_and_drops_missing_entry_point() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "a",
            serde_json::json!({"id": "plugin-a", "displayName": "A", "entryPoint": "index.html"}),
            &["index.html"],
        );
        write_plugin(
            root.path(),
            "b",
            serde_json::json!({"id": "plugin-b", "displayName": "B"}),
            &["index.html"],
        );

        let found = scan(root.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "plugin-a");
        assert_eq!(found[0].folder_name, "a");
        assert_eq!(found[0].folder, root.path().join("a"));
    }

    #[test]
    fn scan_drops_unresolved_files() {
        let root = tempfile::tempdir().unwrap();
        // entryPoint declared but not on disk
        write_plugin(
            root.path(),
            "no-entry",
            serde_json::json!({"id": "x", "displayName": "X", "entryPoint": "index.html"}),
            &[],
        );
        // composeFile declared but not on disk
        write_plugin(
            root.path(),
            "no-compose",
            serde_json::json!({
                "id": "y", "displayName": "Y", "entryPoint": "index.html", "composeFile": "compose.yml"
            }),
            &["index.html"],
        );
        write_plugin(
            root.path(),
            "with-compose",
            serde_json::json!({
                "id": "z", "displayName": "Z", "entryPoint": "index.html", "composeFile": "compose.yml"
            }),
            &["index.html", "compose.yml"],
        );

        assert_eq!(ids(&scan(root.path())), vec!["z"]);
    }

    #[test]
    fn scan_skips_malformed_hidden_and_plain_files() {
        let root = tempfile::tempdir().unwrap();
        let bad = root.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILE), "{ not json").unwrap();

        write_plugin(
            root.path(),
            ".hidden",
            serde_json::json!({"id": "h", "displayName": "H", "entryPoint": "index.html"}),
            &["index.html"],
        );
        std::fs::create_dir_all(root.path().join("empty")).unwrap();
        std::fs::write(root.path().join("stray.txt"), "hi").unwrap();

        assert!(scan(root.path()).is_empty());
    }

    #[test]
    fn scan_reads_legacy_package_json() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("legacy");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(LEGACY_MANIFEST_FILE),
            r#"{"name":"legacy-plugin","pluginName":"Legacy","index":"index.html"}"#,
        )
        .unwrap();
        std::fs::write(dir.join("index.html"), "<html/>").unwrap();

        let found = scan(root.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "legacy-plugin");
        assert_eq!(found[0].manifest.manifest_version, 0);
    }

    #[test]
    fn current_manifest_wins_over_legacy() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(
            root.path(),
            "both",
            serde_json::json!({"id": "new-id", "displayName": "New", "entryPoint": "index.html"}),
            &["index.html"],
        );
        std::fs::write(
            dir.join(LEGACY_MANIFEST_FILE),
            r#"{"name":"old-id","pluginName":"Old","index":"index.html"}"#,
        )
        .unwrap();

        assert_eq!(load_descriptor(&dir).unwrap().id(), "new-id");
    }

    #[test]
    fn scan_of_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(scan(&root.path().join("missing")).is_empty());
    }

    #[test]
    fn at_most_one_descriptor_per_folder() {
        let root = tempfile::tempdir().unwrap();
        for name in ["one", "two", "three"] {
            write_plugin(
                root.path(),
                name,
                serde_json::json!({"id": "same-id", "displayName": name, "entryPoint": "i.html"}),
                &["i.html"],
            );
        }
        let found = scan(root.path());
        assert_eq!(found.len(), 3);
        let mut folders: Vec<_> = found.iter().map(|d| d.folder_name.clone()).collect();
        folders.sort();
        folders.dedup();
        assert_eq!(folders.len(), 3);
    }

    #[test]
    fn load_descriptor_reports_missing_manifest() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_descriptor(root.path()),
            Err(DescriptorError::MissingManifest)
        ));
    }

    #[test]
    fn listing_uses_display_name() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "folder-a",
            serde_json::json!({"id": "a", "displayName": "Plugin A", "entryPoint": "i.html"}),
            &["i.html"],
        );
        let rows = list_folder_contents(root.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Plugin A");
        assert_eq!(rows[0].folder_name, "folder-a");
        let json = serde_json::to_value(&rows[0]).unwrap();
        assert!(json.get("folderName").is_some());
    }
}
