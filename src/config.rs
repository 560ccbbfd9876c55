use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::PathBuf;

/// Environment override for the config directory (tests, portable installs).
pub const CONFIG_DIR_ENV: &str = "OUROBOROS_CONFIG_DIR";

const CONFIG_FILE: &str = "config.json";

/// Get the config directory using platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/ouroboros/`
/// - Linux: `~/.config/ouroboros/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/ouroboros/`
///
/// `OUROBOROS_CONFIG_DIR` wins over all of these. Falls back to
/// `~/.ouroboros/` if no platform dir is available.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|d| d.join("ouroboros"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ouroboros")
        })
}

/// Load a JSON config file, returning Default if missing or corrupt.
/// Corrupt files are logged so they are visible instead of silently resetting.
pub(crate) fn load_json_config<T: DeserializeOwned + Default>(filename: &str) -> T {
    let path = config_dir().join(filename);
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Could not read config {}: {e}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Corrupt config {}: {e}. Using defaults.", path.display());
            T::default()
        }
    }
}

/// Save a JSON config file atomically (temp file + rename).
pub(crate) fn save_json_config<T: Serialize>(filename: &str, config: &T) -> Result<(), String> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).map_err(|e| format!("Failed to create config directory: {e}"))?;

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;

    let target = dir.join(filename);
    let temp = dir.join(format!("{}.tmp.{}", filename, std::process::id()));

    std::fs::write(&temp, &json).map_err(|e| format!("Failed to write temp config: {e}"))?;

    // Either the old file or the new one exists, never a partial write
    std::fs::rename(&temp, &target).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        format!("Failed to commit config: {e}")
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// How the compute server's Compose project is located.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MainServerMode {
    /// Python sources checked out next to the app; images are rebuilt on start.
    Development,
    /// Bundled server resources shipped with the app.
    #[default]
    Production,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MainServerConfig {
    pub enabled: bool,
    pub mode: MainServerMode,
    /// Directory holding `compose.yml` for development runs.
    pub dev_dir: Option<PathBuf>,
    /// Directory holding `compose.yml` for packaged runs.
    pub prod_dir: Option<PathBuf>,
}

impl Default for MainServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: MainServerMode::Production,
            dev_dir: None,
            prod_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Fixed loopback port of the plugin asset server.
    pub asset_server_port: u16,
    /// Port for the shell API; 0 lets the OS pick (written to `shell-port`).
    pub shell_api_port: u16,
    /// Origin prefixes accepted by the iframe message broker.
    pub trusted_origins: Vec<String>,
    /// Deadline for a single `docker compose` invocation.
    pub compose_timeout_secs: u64,
    /// Deadline for a whole plugin download.
    pub download_timeout_secs: u64,
    pub github_api_base: String,
    /// Overrides `{config_dir}/plugins`.
    pub plugins_dir: Option<PathBuf>,
    /// When non-empty, broker file reads/writes must stay under one of these.
    pub broker_fs_roots: Vec<PathBuf>,
    pub main_server: MainServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            asset_server_port: 3000,
            shell_api_port: 0,
            trusted_origins: vec![
                "http://localhost".to_string(),
                "http://127.0.0.1".to_string(),
                "http://0.0.0.0".to_string(),
            ],
            compose_timeout_secs: 300,
            download_timeout_secs: 300,
            github_api_base: "https://api.github.com".to_string(),
            plugins_dir: None,
            broker_fs_roots: Vec::new(),
            main_server: MainServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Root directory holding one folder per installed plugin.
    pub fn plugins_dir(&self) -> PathBuf {
        self.plugins_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("plugins"))
    }
}

pub fn load_app_config() -> AppConfig {
    load_json_config(CONFIG_FILE)
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    save_json_config(CONFIG_FILE, config)
}

/// Create the plugins directory if needed. Failure here is fatal for the app.
pub fn ensure_plugins_dir(config: &AppConfig) -> std::io::Result<PathBuf> {
    let dir = config.plugins_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
