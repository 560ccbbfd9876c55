//! Adding and removing plugins in the plugins directory.
//!
//! Every operation holds the install lock for its whole duration and ends
//! with a lifecycle restart, successful or not, so the published list always
//! matches what is on disk.

use crate::compose::{self, ComposeProject};
use crate::events::{EventBus, ShellEvent};
use crate::github_release::{self, GitHubClient};
use crate::lifecycle::Lifecycle;
use crate::manifest::is_single_segment;
use crate::registry::{self, DescriptorError, PluginDescriptor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("not a GitHub repository or release URL: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("{url} is larger than the {limit} byte limit")]
    TooLarge { url: String, limit: u64 },
    #[error("release has no zip asset and no source archive")]
    NoArchive,
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("invalid plugin: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot install {} into {}, which lies inside it", .source_dir.display(), .target.display())]
    TargetInsideSource { source_dir: PathBuf, target: PathBuf },
    #[error("\"{0}\" is not a plugin folder name")]
    InvalidFolder(String),
    #[error("no plugin installed in \"{0}\"")]
    NotInstalled(String),
    #[error("download did not finish within {0}s")]
    Timeout(u64),
    #[error("install cancelled")]
    Cancelled,
}

impl InstallError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        InstallError::Io {
            context: path.display().to_string(),
            source,
        }
    }
}

/// Recursively copy `src` into `dst`, creating `dst` as needed. Symlinks are
/// not followed; each one is skipped with a warning.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), InstallError> {
    std::fs::create_dir_all(dst).map_err(|e| InstallError::io(dst, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| InstallError::io(src, e))? {
        let entry = entry.map_err(|e| InstallError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| InstallError::io(&from, e))?;
        if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to).map_err(|e| InstallError::io(&from, e))?;
        } else if file_type.is_symlink() {
            tracing::warn!(path = %from.display(), "symlink not copied into plugin folder");
        }
    }
    Ok(())
}

/// Refuse a copy whose destination sits inside its source; it would walk
/// into its own output.
fn ensure_not_nested(source: &Path, target: &Path) -> Result<(), InstallError> {
    let source_dir = source
        .canonicalize()
        .map_err(|e| InstallError::io(source, e))?;
    // The target folder may not exist yet; its parent does
    let target = match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map_err(|e| InstallError::io(parent, e))?
            .join(name),
        _ => target.to_path_buf(),
    };
    if target.starts_with(&source_dir) {
        return Err(InstallError::TargetInsideSource { source_dir, target });
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, InstallError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, InstallError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InstallError::Io {
            context: "background task".into(),
            source: std::io::Error::other(e),
        })?
}

pub struct Installer {
    lifecycle: Arc<Lifecycle>,
    github: GitHubClient,
    events: EventBus,
    download_timeout: Duration,
    lock: tokio::sync::Mutex<()>,
    cancel: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl Installer {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        github: GitHubClient,
        events: EventBus,
        download_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            github,
            events,
            download_timeout,
            lock: tokio::sync::Mutex::new(()),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    /// Copy a plugin folder from anywhere on disk into the plugins directory.
    pub async fn add_local_plugin(&self, source: PathBuf) -> Result<PluginDescriptor, InstallError> {
        let _guard = self.lock.lock().await;
        let result = self.install_from(&source).await;
        self.finish("add-local-plugin", &result).await;
        result
    }

    /// Download a plugin from a GitHub repository or release URL.
    pub async fn download_plugin(&self, url: &str) -> Result<PluginDescriptor, InstallError> {
        let _guard = self.lock.lock().await;
        let result = self.download_locked(url).await;
        *self.cancel.lock() = None;
        self.finish("download-plugin", &result).await;
        result
    }

    /// Abort the download in flight. Returns false when there is none.
    pub fn cancel_install(&self) -> bool {
        match self.cancel.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Stop and remove the plugin installed in `<plugins>/<folder>`.
    pub async fn delete_plugin(&self, folder: &str) -> Result<(), InstallError> {
        let _guard = self.lock.lock().await;
        let result = self.delete_locked(folder).await;
        self.finish("delete-plugin", &result).await;
        result
    }

    async fn finish<T>(&self, operation: &str, result: &Result<T, InstallError>) {
        let error = result.as_ref().err().map(|e| e.to_string());
        match &error {
            Some(e) => tracing::error!(operation, "{e}"),
            None => tracing::info!(operation, "finished"),
        }
        self.lifecycle.restart().await;
        self.events.emit(ShellEvent::InstallFinished {
            operation: operation.to_string(),
            error,
        });
    }

    async fn download_locked(&self, url: &str) -> Result<PluginDescriptor, InstallError> {
        let release = github_release::parse_release_url(url)
            .ok_or_else(|| InstallError::InvalidUrl(url.to_string()))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.cancel.lock() = Some(cancel_tx);

        let staging = tempfile::tempdir()
            .map_err(|e| InstallError::io(&std::env::temp_dir(), e))?;
        let extract_to = staging.path().to_path_buf();

        let fetch = async {
            let info = self.github.fetch_release(&release).await?;
            let archive_url = info.archive_url().ok_or(InstallError::NoArchive)?.to_string();
            tracing::info!(
                repo = %format!("{}/{}", release.owner, release.repo),
                tag = %info.tag_name,
                "downloading plugin"
            );
            let bytes = self.github.download(&archive_url).await?;
            blocking(move || {
                github_release::extract_zip(&bytes, &extract_to)?;
                Ok(github_release::locate_plugin_root(&extract_to))
            })
            .await
        };

        let root = tokio::select! {
            r = tokio::time::timeout(self.download_timeout, fetch) => {
                r.map_err(|_| InstallError::Timeout(self.download_timeout.as_secs()))??
            }
            _ = cancel_rx => return Err(InstallError::Cancelled),
        };

        // `staging` outlives the copy and is removed when dropped
        self.install_from(&root).await
    }

    async fn install_from(&self, source: &Path) -> Result<PluginDescriptor, InstallError> {
        let descriptor = {
            let source = source.to_path_buf();
            blocking(move || Ok(registry::load_descriptor(&source)?)).await?
        };
        let target = self.lifecycle.plugins_dir().join(descriptor.id());

        if same_dir(source, &target) {
            tracing::info!(plugin = %descriptor.id(), "plugin already in place");
        } else {
            {
                let (from, to) = (source.to_path_buf(), target.clone());
                blocking(move || ensure_not_nested(&from, &to)).await?;
            }
            self.remove_existing(descriptor.id()).await?;
            let (from, to) = (source.to_path_buf(), target.clone());
            let copied = blocking(move || copy_dir_recursive(&from, &to)).await;
            if let Err(e) = copied {
                let _ = tokio::fs::remove_dir_all(&target).await;
                return Err(e);
            }
        }

        let installed = {
            let target = target.clone();
            blocking(move || Ok(registry::load_descriptor(&target)?)).await?
        };
        if let Some(file) = installed.compose_path() {
            compose::build_logged(&**self.lifecycle.compose(), &ComposeProject::from_file(file))
                .await;
        }

        tracing::info!(plugin = %installed.id(), path = %target.display(), "plugin installed");
        Ok(installed)
    }

    /// Stop the service of whatever is installed in `<plugins>/<folder>` and
    /// remove it.
    async fn remove_existing(&self, folder: &str) -> Result<(), InstallError> {
        let target = self.lifecycle.plugins_dir().join(folder);
        if tokio::fs::symlink_metadata(&target).await.is_err() {
            return Ok(());
        }
        self.lifecycle.stop_plugin(folder).await;
        tokio::fs::remove_dir_all(&target)
            .await
            .map_err(|e| InstallError::io(&target, e))
    }

    async fn delete_locked(&self, folder: &str) -> Result<(), InstallError> {
        if !is_single_segment(folder) {
            return Err(InstallError::InvalidFolder(folder.to_string()));
        }
        let target = self.lifecycle.plugins_dir().join(folder);
        if !tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            return Err(InstallError::NotInstalled(folder.to_string()));
        }
        self.remove_existing(folder).await?;
        tracing::info!(folder, "plugin removed");
        Ok(())
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
