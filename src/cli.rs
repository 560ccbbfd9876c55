//! Locating the `docker` CLI.
//!
//! A host launched from Finder, Explorer or a desktop launcher does not
//! inherit the user's shell PATH, so `docker` is often not found by name.
//! We probe the directories Docker Desktop, Colima and distro packages
//! install into and remember the answer for the lifetime of the process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Directories where `docker` lives but that a desktop-launched app does not
/// have on PATH.
fn extra_bin_dirs() -> &'static [String] {
    static DIRS: OnceLock<Vec<String>> = OnceLock::new();
    DIRS.get_or_init(|| {
        let home = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut dirs = Vec::new();

        #[cfg(target_os = "macos")]
        {
            dirs.extend([
                "/usr/local/bin".to_string(),
                "/opt/homebrew/bin".to_string(),
                "/Applications/Docker.app/Contents/Resources/bin".to_string(),
                format!("{home}/.docker/bin"),
                format!("{home}/.colima/bin"),
            ]);
        }

        #[cfg(target_os = "linux")]
        {
            dirs.extend([
                "/usr/bin".to_string(),
                "/usr/local/bin".to_string(),
                format!("{home}/.local/bin"),
                format!("{home}/.docker/bin"),
                "/snap/bin".to_string(),
            ]);
        }

        #[cfg(target_os = "windows")]
        {
            let program_files =
                std::env::var("ProgramFiles").unwrap_or_else(|_| "C:\\Program Files".to_string());
            dirs.extend([
                format!("{program_files}\\Docker\\Docker\\resources\\bin"),
                format!("{home}\\scoop\\shims"),
            ]);
        }

        dirs
    })
}

fn executable_name(name: &str) -> String {
    if cfg!(target_os = "windows") && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// Resolve a CLI binary to a full path, probing well-known install
/// directories. Falls back to the bare name so PATH lookup still applies.
///
/// Cached per name: tool locations do not move while the host runs.
pub(crate) fn resolve_cli(name: &str) -> String {
    static CACHE: OnceLock<parking_lot::Mutex<HashMap<String, String>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| parking_lot::Mutex::new(HashMap::new()));

    if let Some(cached) = cache.lock().get(name) {
        return cached.clone();
    }

    let resolved = resolve_cli_in(name, extra_bin_dirs());
    cache.lock().insert(name.to_string(), resolved.clone());
    resolved
}

fn resolve_cli_in(name: &str, dirs: &[String]) -> String {
    let file = executable_name(name);
    for dir in dirs {
        let candidate = Path::new(dir).join(&file);
        if candidate.is_file() {
            return candidate.to_string_lossy().to_string();
        }
    }
    name.to_string()
}
