//! Plugin manifest parsing and validation.
//!
//! A plugin folder declares itself with `manifest.json`:
//!
//! ```json
//! {
//!   "manifestVersion": 1,
//!   "id": "slice-viewer",
//!   "displayName": "Slice Viewer",
//!   "entryPoint": "dist/index.html",
//!   "icon": "icon.svg",
//!   "composeFile": "compose.yml"
//! }
//! ```
//!
//! Plugins written before the manifest was versioned ship a `package.json`
//! with `name` / `pluginName` / `index` / `dockerCompose` instead. Those are
//! read as version 0 and mapped onto the current fields.
//!
//! Validation here is pure: whether the referenced files exist is checked by
//! the registry against the plugin folder.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// File name of the current manifest format.
pub const MANIFEST_FILE: &str = "manifest.json";

/// File name of the unversioned manifest used by older plugins.
pub const LEGACY_MANIFEST_FILE: &str = "package.json";

/// Highest manifest version this build understands.
pub const CURRENT_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON or does not match the schema: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported manifestVersion {0} (this build reads version 1)")]
    UnsupportedVersion(u32),
    #[error("{0} is empty")]
    EmptyField(&'static str),
    #[error("{field} \"{value}\" attempts path traversal")]
    PathEscape { field: &'static str, value: String },
    #[error("id \"{0}\" must be a single folder name")]
    InvalidId(String),
}

/// Plugin manifest as declared in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    pub id: String,
    pub display_name: String,
    pub entry_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<String>,
}

fn default_manifest_version() -> u32 {
    CURRENT_MANIFEST_VERSION
}

/// The pre-versioning `package.json` layout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyManifest {
    name: String,
    plugin_name: String,
    index: String,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    docker_compose: Option<String>,
    #[serde(default)]
    dockerfile: Option<String>,
}

impl From<LegacyManifest> for PluginManifest {
    fn from(legacy: LegacyManifest) -> Self {
        PluginManifest {
            manifest_version: 0,
            id: legacy.name,
            display_name: legacy.plugin_name,
            entry_point: legacy.index,
            icon: legacy.icon,
            compose_file: legacy.docker_compose.or(legacy.dockerfile),
        }
    }
}

/// Parse and validate the text of a `manifest.json`.
pub fn validate(raw: &str) -> Result<PluginManifest, ManifestError> {
    let manifest: PluginManifest = serde_json::from_str(raw)?;
    if manifest.manifest_version != CURRENT_MANIFEST_VERSION {
        return Err(ManifestError::UnsupportedVersion(manifest.manifest_version));
    }
    check_fields(&manifest)?;
    Ok(manifest)
}

/// Parse and validate the text of a legacy `package.json`.
pub fn validate_legacy(raw: &str) -> Result<PluginManifest, ManifestError> {
    let legacy: LegacyManifest = serde_json::from_str(raw)?;
    let manifest = PluginManifest::from(legacy);
    check_fields(&manifest)?;
    Ok(manifest)
}

fn check_fields(manifest: &PluginManifest) -> Result<(), ManifestError> {
    if manifest.id.trim().is_empty() {
        return Err(ManifestError::EmptyField("id"));
    }
    if !is_single_segment(&manifest.id) {
        return Err(ManifestError::InvalidId(manifest.id.clone()));
    }
    if manifest.display_name.trim().is_empty() {
        return Err(ManifestError::EmptyField("displayName"));
    }
    check_relative("entryPoint", &manifest.entry_point)?;
    if let Some(icon) = &manifest.icon {
        check_relative("icon", icon)?;
    }
    if let Some(compose) = &manifest.compose_file {
        check_relative("composeFile", compose)?;
    }
    Ok(())
}

fn check_relative(field: &'static str, value: &str) -> Result<(), ManifestError> {
    if value.is_empty() {
        return Err(ManifestError::EmptyField(field));
    }
    if is_path_escape(value) {
        return Err(ManifestError::PathEscape {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Returns true if a relative path attempts to escape its root via `..`,
/// absolute components, or drive prefixes.
pub(crate) fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);

    if path.is_absolute() {
        return true;
    }

    path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// True for a plain folder name: one normal component, not hidden.
pub(crate) fn is_single_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.starts_with('.')
        && !name.contains(['/', '\\'])
}
