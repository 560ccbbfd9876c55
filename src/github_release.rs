//! Fetching plugin archives from GitHub releases.

use crate::install::InstallError;
use futures_util::StreamExt;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Which release of which repository to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRef {
    pub owner: String,
    pub repo: String,
    /// `None` means the latest release.
    pub tag: Option<String>,
}

impl ReleaseRef {
    fn api_path(&self) -> String {
        match &self.tag {
            Some(tag) => format!("/repos/{}/{}/releases/tags/{tag}", self.owner, self.repo),
            None => format!("/repos/{}/{}/releases/latest", self.owner, self.repo),
        }
    }
}

/// Parse a repository or release page URL.
///
/// Accepted: `https://github.com/<owner>/<repo>` optionally followed by
/// `/releases`, `/releases/latest` or `/releases/tag/<tag>`.
pub fn parse_release_url(raw: &str) -> Option<ReleaseRef> {
    let url = url::Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "https" | "http") {
        return None;
    }
    if !matches!(url.host_str()?, "github.com" | "www.github.com") {
        return None;
    }

    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let (owner, repo, rest) = match segments.as_slice() {
        [owner, repo, rest @ ..] => (*owner, *repo, rest),
        _ => return None,
    };
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return None;
    }

    let tag = match rest {
        [] | ["releases"] | ["releases", "latest"] => None,
        // Kept percent-encoded; it goes straight back into an API path
        ["releases", "tag", tag] => Some(tag.to_string()),
        _ => return None,
    };

    Some(ReleaseRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
        tag,
    })
}

/// Run `gh auth token` to pick up a token from gh's credential store.
fn token_from_gh_cli() -> Option<String> {
    let output = std::process::Command::new(crate::cli::resolve_cli("gh"))
        .args(["auth", "token"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8(output.stdout).ok()?;
    let token = token.trim().to_string();
    if token.is_empty() { None } else { Some(token) }
}

/// GitHub token for API calls: `GH_TOKEN`, then `GITHUB_TOKEN`, then the gh
/// CLI. Anonymous access works for public repositories, so `None` is fine.
pub fn resolve_github_token() -> Option<String> {
    for var in ["GH_TOKEN", "GITHUB_TOKEN"] {
        if let Ok(token) = std::env::var(var)
            && !token.is_empty()
        {
            return Some(token);
        }
    }
    token_from_gh_cli()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub zipball_url: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

impl Release {
    /// First `.zip` asset, else the source zipball.
    pub fn archive_url(&self) -> Option<&str> {
        self.assets
            .iter()
            .find(|a| a.name.to_ascii_lowercase().ends_with(".zip"))
            .map(|a| a.browser_download_url.as_str())
            .or(self.zipball_url.as_deref())
    }
}

/// Largest release archive `download` accepts.
pub const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
    max_download: u64,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            max_download: MAX_ARCHIVE_BYTES,
        }
    }

    pub fn with_max_download(mut self, bytes: u64) -> Self {
        self.max_download = bytes;
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, "ouroboros")
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn fetch_release(&self, release: &ReleaseRef) -> Result<Release, InstallError> {
        let url = format!("{}{}", self.api_base, release.api_path());
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(InstallError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>, InstallError> {
        let resp = self.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(InstallError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let too_large = || InstallError::TooLarge {
            url: url.to_string(),
            limit: self.max_download,
        };
        if resp.content_length().is_some_and(|len| len > self.max_download) {
            return Err(too_large());
        }

        // Content-Length may be absent or wrong; count what actually arrives
        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > self.max_download {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Unpack a zip archive into `dest`. Entries that would land outside `dest`
/// and symlinks are skipped. Returns the number of files written.
pub fn extract_zip(archive: &[u8], dest: &Path) -> Result<usize, InstallError> {
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))?;
    let mut written = 0;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            tracing::warn!(name = entry.name(), "skipping archive entry outside the plugin");
            continue;
        };
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000)
        {
            continue;
        }

        let out = dest.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(|e| InstallError::io(&out, e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| InstallError::io(&out, e))?;
        std::fs::write(&out, data).map_err(|e| InstallError::io(&out, e))?;
        written += 1;
    }

    Ok(written)
}

/// The folder holding the plugin inside an extracted archive: the
/// directory itself when it has a manifest, else its only subdirectory
/// (GitHub zipballs wrap everything in `<owner>-<repo>-<sha>/`).
pub fn locate_plugin_root(extracted: &Path) -> PathBuf {
    if crate::registry::has_manifest(extracted) {
        return extracted.to_path_buf();
    }
    let subdirs: Vec<PathBuf> = std::fs::read_dir(extracted)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| !n.to_string_lossy().starts_with('.'))
                })
                .collect()
        })
        .unwrap_or_default();
    match subdirs.as_slice() {
        [only] => only.clone(),
        _ => extracted.to_path_buf(),
    }
}
