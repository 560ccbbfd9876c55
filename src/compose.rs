//! Docker Compose process manager.
//!
//! Plugins (and the compute server) that ship a Compose file get their
//! service brought up with `docker compose up -d` and torn down with
//! `docker compose down`. Every invocation runs under a deadline; a timed
//! out child is killed.
//!
//! The lifecycle controller only sees the [`ComposeManager`] trait so it can
//! be driven by a fake in tests.

use futures_util::future::BoxFuture;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

/// A Compose file and the directory `docker compose` runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub dir: PathBuf,
    pub file: PathBuf,
}

impl ComposeProject {
    /// Project rooted at the file's parent directory.
    pub fn from_file(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { dir, file }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("docker compose {action} timed out after {secs}s")]
    Timeout { action: &'static str, secs: u64 },
    #[error("docker compose {action} failed ({status}): {stderr}")]
    Failed {
        action: &'static str,
        status: String,
        stderr: String,
    },
    #[error("docker compose {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Observed state of one plugin's Compose service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ComposeState {
    Unknown,
    Starting,
    Up,
    StartFailed,
    Stopping,
    Down,
    StopFailed,
}

impl ComposeState {
    /// A start is already in flight or has succeeded.
    pub fn is_running(self) -> bool {
        matches!(self, ComposeState::Starting | ComposeState::Up)
    }
}

/// Result of probing the Docker installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Availability {
    pub fn ok() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait ComposeManager: Send + Sync {
    /// `up -d`, optionally rebuilding images first.
    fn up<'a>(
        &'a self,
        project: &'a ComposeProject,
        build: bool,
    ) -> BoxFuture<'a, Result<(), ComposeError>>;

    fn down<'a>(&'a self, project: &'a ComposeProject) -> BoxFuture<'a, Result<(), ComposeError>>;

    fn build<'a>(&'a self, project: &'a ComposeProject) -> BoxFuture<'a, Result<(), ComposeError>>;

    fn check_availability(&self) -> BoxFuture<'_, Availability>;
}

/// Start `project` in the background. Failure is handed to `on_error`
/// rather than returned; callers never wait for the service to be up.
pub fn start_detached<F>(
    manager: Arc<dyn ComposeManager>,
    project: ComposeProject,
    build: bool,
    on_error: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnOnce(ComposeError) + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = manager.up(&project, build).await {
            on_error(e);
        }
    })
}

/// Build `project`, logging instead of propagating failure.
pub async fn build_logged(manager: &dyn ComposeManager, project: &ComposeProject) {
    match manager.build(project).await {
        Ok(()) => tracing::info!(file = %project.file.display(), "compose build finished"),
        Err(e) => tracing::error!(file = %project.file.display(), "compose build failed: {e}"),
    }
}

// ---------------------------------------------------------------------------
// docker CLI implementation
// ---------------------------------------------------------------------------

/// Drives the real `docker compose` CLI.
pub struct DockerCompose {
    program: String,
    timeout: Duration,
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

impl DockerCompose {
    pub fn new(timeout: Duration) -> Self {
        Self::with_program(crate::cli::resolve_cli("docker"), timeout)
    }

    pub fn with_program(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn compose_args(project: &ComposeProject, tail: &[&str]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["compose".into(), "-f".into(), project.file.clone().into()];
        args.extend(tail.iter().map(OsString::from));
        args
    }

    async fn run(
        &self,
        action: &'static str,
        dir: Option<&Path>,
        args: Vec<OsString>,
        timeout: Duration,
    ) -> Result<String, ComposeError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(program = %self.program, ?args, "running docker");
        let child = cmd.spawn().map_err(|source| ComposeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // On timeout the future (and the child with it) is dropped, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ComposeError::Io { action, source })?,
            Err(_) => {
                return Err(ComposeError::Timeout {
                    action,
                    secs: timeout.as_secs(),
                });
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ComposeError::Failed {
                action,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl ComposeManager for DockerCompose {
    fn up<'a>(
        &'a self,
        project: &'a ComposeProject,
        build: bool,
    ) -> BoxFuture<'a, Result<(), ComposeError>> {
        Box::pin(async move {
            let tail: &[&str] = if build { &["up", "-d", "--build"] } else { &["up", "-d"] };
            self.run("up", Some(&project.dir), Self::compose_args(project, tail), self.timeout)
                .await?;
            tracing::info!(file = %project.file.display(), "compose service up");
            Ok(())
        })
    }

    fn down<'a>(&'a self, project: &'a ComposeProject) -> BoxFuture<'a, Result<(), ComposeError>> {
        Box::pin(async move {
            self.run("down", Some(&project.dir), Self::compose_args(project, &["down"]), self.timeout)
                .await?;
            tracing::info!(file = %project.file.display(), "compose service down");
            Ok(())
        })
    }

    fn build<'a>(&'a self, project: &'a ComposeProject) -> BoxFuture<'a, Result<(), ComposeError>> {
        Box::pin(async move {
            self.run("build", Some(&project.dir), Self::compose_args(project, &["build"]), self.timeout)
                .await
                .map(|_| ())
        })
    }

    fn check_availability(&self) -> BoxFuture<'_, Availability> {
        Box::pin(async move {
            let probe_timeout = self.timeout.min(PROBE_TIMEOUT);
            if let Err(e) = self.run("--version", None, vec!["--version".into()], probe_timeout).await {
                return Availability::unavailable(format!("Docker is not installed: {e}"));
            }
            if let Err(e) = self.run("info", None, vec!["info".into()], probe_timeout).await {
                return Availability::unavailable(format!("Docker is not running: {e}"));
            }
            Availability::ok()
        })
    }
}
