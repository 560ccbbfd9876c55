//! Plugin lifecycle: scan, start services, publish the plugin list.
//!
//! `start_all` and `stop_all` run one at a time. A start cycle scans the
//! plugins directory, kicks off every declared Compose service without
//! waiting for it, and publishes a fresh, immutable [`PluginDetail`] list.
//! A stop cycle waits for every service to come down.
//!
//! Compose bookkeeping is keyed by plugin folder, since two folders may
//! carry the same manifest id. Each entry remembers the project it started
//! so the service can still be stopped after its folder or manifest is gone.

use crate::asset_server::AssetUrls;
use crate::compose::{self, ComposeManager, ComposeProject, ComposeState};
use crate::events::{EventBus, ShellEvent};
use crate::registry::{self, PluginDescriptor};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What the renderer needs to mount one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDetail {
    pub id: String,
    pub name: String,
    pub index_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
}

impl PluginDetail {
    fn from_descriptor(descriptor: &PluginDescriptor, urls: &AssetUrls) -> Self {
        let folder = &descriptor.folder_name;
        PluginDetail {
            id: descriptor.id().to_string(),
            name: descriptor.display_name().to_string(),
            index_path: urls.url_for(folder, &descriptor.manifest.entry_point),
            icon_path: descriptor
                .manifest
                .icon
                .as_deref()
                .map(|icon| urls.url_for(folder, icon)),
        }
    }
}

pub type PluginDetails = Arc<Vec<PluginDetail>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    NotStarted,
    Starting,
    Ready,
    /// Shutting down; no further start cycles run.
    Draining,
}

pub const DOCKER_ALERT_TITLE: &str = "Docker Not Found";

/// Compose state of one plugin folder, as reported by `GET /plugins/services`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub folder: String,
    pub plugin_id: String,
    pub state: ComposeState,
}

struct Service {
    plugin_id: String,
    project: ComposeProject,
    state: ComposeState,
    /// `up` still in flight.
    pending: Option<JoinHandle<()>>,
}

/// A service to bring down.
#[derive(Clone)]
struct StopTarget {
    folder: String,
    plugin_id: String,
    project: ComposeProject,
}

impl StopTarget {
    fn from_descriptor(descriptor: &PluginDescriptor) -> Option<Self> {
        Some(StopTarget {
            folder: descriptor.folder_name.clone(),
            plugin_id: descriptor.id().to_string(),
            project: ComposeProject::from_file(descriptor.compose_path()?),
        })
    }
}

type Services = DashMap<String, Service>;

pub struct Lifecycle {
    plugins_dir: PathBuf,
    compose: Arc<dyn ComposeManager>,
    urls: AssetUrls,
    events: EventBus,
    phase: parking_lot::Mutex<Phase>,
    cycle: tokio::sync::Mutex<()>,
    services: Arc<Services>,
    docker_alerted: AtomicBool,
    details_tx: watch::Sender<PluginDetails>,
}

impl Lifecycle {
    pub fn new(
        plugins_dir: PathBuf,
        compose: Arc<dyn ComposeManager>,
        urls: AssetUrls,
        events: EventBus,
    ) -> Self {
        let (details_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            plugins_dir,
            compose,
            urls,
            events,
            phase: parking_lot::Mutex::new(Phase::NotStarted),
            cycle: tokio::sync::Mutex::new(()),
            services: Arc::new(DashMap::new()),
            docker_alerted: AtomicBool::new(false),
            details_tx,
        }
    }

    pub fn plugins_dir(&self) -> &PathBuf {
        &self.plugins_dir
    }

    pub fn compose(&self) -> &Arc<dyn ComposeManager> {
        &self.compose
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Current published list.
    pub fn details(&self) -> PluginDetails {
        self.details_tx.borrow().clone()
    }

    /// Watch the published list; each start cycle replaces it wholesale.
    pub fn subscribe(&self) -> watch::Receiver<PluginDetails> {
        self.details_tx.subscribe()
    }

    /// Compose state of every plugin folder seen so far, sorted by folder.
    pub fn service_states(&self) -> Vec<ServiceStatus> {
        let mut states: Vec<_> = self
            .services
            .iter()
            .map(|e| ServiceStatus {
                folder: e.key().clone(),
                plugin_id: e.plugin_id.clone(),
                state: e.state,
            })
            .collect();
        states.sort_by(|a, b| a.folder.cmp(&b.folder));
        states
    }

    pub fn service_state(&self, folder: &str) -> ComposeState {
        self.services
            .get(folder)
            .map(|s| s.state)
            .unwrap_or(ComposeState::Unknown)
    }

    /// Scan, start every declared service in the background, and publish the
    /// resulting list. Returns before any service is up.
    pub async fn start_all(&self) -> PluginDetails {
        let _cycle = self.cycle.lock().await;
        self.start_locked().await
    }

    /// Stop every declared service and wait for all of them. Individual
    /// failures are logged, never propagated.
    pub async fn stop_all(&self) {
        let _cycle = self.cycle.lock().await;
        self.stop_locked().await;
    }

    /// `stop_all` then `start_all` as one cycle.
    pub async fn restart(&self) -> PluginDetails {
        let _cycle = self.cycle.lock().await;
        self.stop_locked().await;
        self.start_locked().await
    }

    /// Final stop. Later start requests only return the last list.
    pub async fn shutdown(&self) {
        let _cycle = self.cycle.lock().await;
        *self.phase.lock() = Phase::Draining;
        self.stop_locked().await;
    }

    /// Stop the service of the plugin in `<plugins>/<folder>`, if it has one.
    ///
    /// The project recorded when the service was started wins over the
    /// folder's current manifest, which may have been edited or broken since.
    pub async fn stop_plugin(&self, folder: &str) {
        let _cycle = self.cycle.lock().await;
        let Some(target) = self.stop_target(folder).await else {
            return;
        };
        stop_one(&*self.compose, &self.services, &self.events, target).await;
    }

    async fn start_locked(&self) -> PluginDetails {
        if self.phase() == Phase::Draining {
            tracing::debug!("start_all ignored while draining");
            return self.details();
        }
        *self.phase.lock() = Phase::Starting;

        let descriptors = self.scan().await;
        let with_compose: Vec<&PluginDescriptor> = descriptors
            .iter()
            .filter(|d| d.manifest.compose_file.is_some())
            .collect();

        if !with_compose.is_empty() {
            let availability = self.compose.check_availability().await;
            if availability.available {
                for descriptor in &with_compose {
                    self.spawn_start(descriptor);
                }
            } else {
                let reason = availability.reason.unwrap_or_default();
                tracing::error!("{reason}");
                self.alert_docker_missing(with_compose[0].display_name());
            }
        }

        let details: PluginDetails = Arc::new(
            descriptors
                .iter()
                .map(|d| PluginDetail::from_descriptor(d, &self.urls))
                .collect(),
        );
        tracing::info!(count = details.len(), "plugins loaded");

        self.details_tx.send_replace(details.clone());
        self.events.emit(ShellEvent::PluginPaths(details.to_vec()));
        *self.phase.lock() = Phase::Ready;
        details
    }

    async fn stop_locked(&self) {
        let mut targets: BTreeMap<String, StopTarget> = self
            .scan()
            .await
            .iter()
            .filter_map(StopTarget::from_descriptor)
            .map(|t| (t.folder.clone(), t))
            .collect();

        // Services whose folder vanished or no longer parses
        for entry in self.services.iter() {
            if targets.contains_key(entry.key()) {
                continue;
            }
            if entry.state.is_running() || entry.pending.is_some() {
                targets.insert(
                    entry.key().clone(),
                    StopTarget {
                        folder: entry.key().clone(),
                        plugin_id: entry.plugin_id.clone(),
                        project: entry.project.clone(),
                    },
                );
            }
        }

        let stops = targets
            .into_values()
            .map(|t| stop_one(&*self.compose, &self.services, &self.events, t));
        futures_util::future::join_all(stops).await;
    }

    async fn stop_target(&self, folder: &str) -> Option<StopTarget> {
        let tracked = self.services.get(folder).map(|s| StopTarget {
            folder: folder.to_string(),
            plugin_id: s.plugin_id.clone(),
            project: s.project.clone(),
        });
        if tracked.is_some() {
            return tracked;
        }

        let path = self.plugins_dir.join(folder);
        match tokio::task::spawn_blocking(move || registry::load_descriptor(&path)).await {
            Ok(Ok(descriptor)) => StopTarget::from_descriptor(&descriptor),
            Ok(Err(e)) => {
                tracing::debug!(folder, "no service to stop: {e}");
                None
            }
            Err(e) => {
                tracing::error!("descriptor task failed: {e}");
                None
            }
        }
    }

    async fn scan(&self) -> Vec<PluginDescriptor> {
        let root = self.plugins_dir.clone();
        tokio::task::spawn_blocking(move || registry::scan(&root))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("plugin scan task failed: {e}");
                Vec::new()
            })
    }

    fn spawn_start(&self, descriptor: &PluginDescriptor) {
        let Some(target) = StopTarget::from_descriptor(descriptor) else {
            return;
        };
        let folder = target.folder.clone();

        let current = self.service_state(&folder);
        if current.is_running() {
            tracing::debug!(%folder, ?current, "service already started");
            return;
        }
        record(&self.services, &self.events, &target, ComposeState::Starting);

        let services = self.services.clone();
        let events = self.events.clone();
        let name = descriptor.display_name().to_string();
        let compose = self.compose.clone();
        let project = target.project;

        let task = tokio::spawn({
            let folder = folder.clone();
            async move {
                let on_error = {
                    let services = services.clone();
                    let events = events.clone();
                    let folder = folder.clone();
                    move |e: compose::ComposeError| {
                        tracing::error!(plugin = %name, "failed to start plugin service: {e}");
                        advance(&services, &events, &folder, ComposeState::StartFailed);
                    }
                };
                let handle = compose::start_detached(compose, project, false, on_error);
                if handle.await.is_ok() {
                    advance(&services, &events, &folder, ComposeState::Up);
                }
            }
        });
        if let Some(mut service) = self.services.get_mut(&folder) {
            service.pending = Some(task);
        }
    }

    fn alert_docker_missing(&self, plugin_name: &str) {
        if self.docker_alerted.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = format!(
            "Docker was not found on your system. Start Docker if it is installed, \
             otherwise please install Docker to use Ouroboros with plugin \"{plugin_name}\"."
        );
        tracing::error!("{message}");
        self.events.emit(ShellEvent::Alert {
            title: DOCKER_ALERT_TITLE.to_string(),
            message,
        });
    }
}

fn emit_state(events: &EventBus, folder: &str, plugin_id: &str, state: ComposeState) {
    events.emit(ShellEvent::ServiceState {
        folder: folder.to_string(),
        plugin_id: plugin_id.to_string(),
        state,
    });
}

/// Set the state of `target.folder`, creating or refreshing its entry.
fn record(services: &Services, events: &EventBus, target: &StopTarget, state: ComposeState) {
    {
        let mut entry = services
            .entry(target.folder.clone())
            .or_insert_with(|| Service {
                plugin_id: target.plugin_id.clone(),
                project: target.project.clone(),
                state,
                pending: None,
            });
        entry.plugin_id = target.plugin_id.clone();
        entry.project = target.project.clone();
        entry.state = state;
    }
    emit_state(events, &target.folder, &target.plugin_id, state);
}

/// Move a starting service on; a stop that got in first wins.
fn advance(services: &Services, events: &EventBus, folder: &str, state: ComposeState) {
    let plugin_id = match services.get_mut(folder) {
        Some(mut service) if service.state == ComposeState::Starting => {
            service.state = state;
            service.plugin_id.clone()
        }
        _ => return,
    };
    emit_state(events, folder, &plugin_id, state);
}

/// Wait out any `up` still in flight, then bring the project down.
async fn stop_one(
    compose: &dyn ComposeManager,
    services: &Services,
    events: &EventBus,
    target: StopTarget,
) {
    let pending = services
        .get_mut(&target.folder)
        .and_then(|mut service| service.pending.take());
    if let Some(task) = pending
        && let Err(e) = task.await
    {
        tracing::warn!(folder = %target.folder, "service start task failed: {e}");
    }

    record(services, events, &target, ComposeState::Stopping);
    let state = match compose.down(&target.project).await {
        Ok(()) => ComposeState::Down,
        Err(e) => {
            tracing::error!(plugin = %target.plugin_id, "failed to stop plugin service: {e}");
            ComposeState::StopFailed
        }
    };
    record(services, events, &target, state);
}
