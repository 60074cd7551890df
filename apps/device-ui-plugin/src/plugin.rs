use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_bus::Bus;

use crate::bus::BridgeError;
use crate::bus_ingest::{Bridge, InboundHandler};
use crate::bus_publisher::{CornerTarget, UiPublisher};
use crate::config::HostConfig;
use crate::host::{ConfigStore, ProtocolEvent, ProtocolStore, StepOptions, StoreError};
use crate::protocol_sync::{StepSchema, StepSynchronizer, SyncError};
use crate::settings::{self, WireSettings};
use crate::supervisor::{
    Supervisor, SupervisorError, SupervisorEvent, WorkerLauncher, WorkerSpec, WorkerStatus,
};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Everything the plugin needs from its host.
pub struct PluginParts {
    pub name: String,
    pub worker: WorkerSpec,
    pub bus: Arc<dyn Bus>,
    pub config: Arc<dyn ConfigStore>,
    pub protocol: Arc<dyn ProtocolStore>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub heartbeat: Duration,
    pub max_restarts: Option<u32>,
}

/// Explicit plugin context: one instance per host, constructed once and
/// driven through `enable`, `disable`, `request_shutdown` and `teardown`.
pub struct DeviceUiPlugin {
    name: String,
    config: Arc<dyn ConfigStore>,
    protocol: Arc<dyn ProtocolStore>,
    bridge: Bridge,
    supervisor: Supervisor,
    sync: StepSynchronizer,
    terminate_requested: AtomicBool,
    terminated: Notify,
    watcher: Mutex<Option<CancellationToken>>,
}

impl DeviceUiPlugin {
    pub fn new(parts: PluginParts) -> Self {
        let bridge = Bridge::new(parts.bus);
        let publisher = bridge.publisher().clone();
        let supervisor = Supervisor::new(
            parts.worker,
            parts.launcher,
            Arc::clone(&parts.config),
            publisher.clone(),
        )
        .with_period(parts.heartbeat)
        .with_max_restarts(parts.max_restarts);
        let sync = StepSynchronizer::new(
            parts.name.clone(),
            StepSchema::video(),
            Arc::clone(&parts.protocol),
            publisher,
        );
        Self {
            name: parts.name,
            config: parts.config,
            protocol: parts.protocol,
            bridge,
            supervisor,
            sync,
            terminate_requested: AtomicBool::new(false),
            terminated: Notify::new(),
            watcher: Mutex::new(None),
        }
    }

    /// Context wired from the environment-derived host config.
    pub fn from_config(
        cfg: &HostConfig,
        bus: Arc<dyn Bus>,
        config: Arc<dyn ConfigStore>,
        protocol: Arc<dyn ProtocolStore>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self::new(PluginParts {
            name: cfg.plugin_name.clone(),
            worker: cfg.worker_spec(),
            bus,
            config,
            protocol,
            launcher,
            heartbeat: cfg.heartbeat_interval(),
            max_restarts: cfg.max_restarts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher(&self) -> &UiPublisher {
        self.bridge.publisher()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn synchronizer(&self) -> &StepSynchronizer {
        &self.sync
    }

    pub fn subscribe_supervisor(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.subscribe()
    }

    /// Connects the bus, starts the worker, then publishes the schema and the
    /// current protocol snapshot.
    pub async fn enable(self: &Arc<Self>) -> Result<WorkerStatus, PluginError> {
        self.terminate_requested.store(false, Ordering::Release);
        self.bridge.connect(Arc::clone(self) as Arc<dyn InboundHandler>);

        let settings = self.config.load(&self.name).await?;
        let status = self.supervisor.start(settings).await?;

        self.sync.publish_schema()?;
        let steps = self.sync.publish_snapshot().await?;
        self.spawn_protocol_watch();
        info!(plugin = %self.name, pid = ?status.pid, steps, "plugin enabled");
        Ok(status)
    }

    /// Stops supervising the worker. The worker process itself is not killed.
    pub fn disable(&self) {
        if let Some(token) = self.watcher.lock().take() {
            token.cancel();
        }
        self.supervisor.stop();
        info!(plugin = %self.name, "plugin disabled");
    }

    /// Disables the plugin and closes the bus session.
    pub fn teardown(&self) {
        self.disable();
        self.bridge.disconnect();
    }

    /// Host is exiting: ask the worker for its settings. The terminate notice
    /// follows once the reply has been saved.
    pub fn request_shutdown(&self) -> Result<(), PluginError> {
        self.terminate_requested.store(true, Ordering::Release);
        self.publisher().request_settings()?;
        debug!(plugin = %self.name, "requested worker settings before shutdown");
        Ok(())
    }

    /// Resolves once the terminate notice has been published.
    pub async fn terminated(&self) {
        self.terminated.notified().await;
    }

    /// Persists `update` over the stored settings. Returns `false` when every
    /// field already matched and nothing was written.
    pub async fn save_ui_settings(&self, update: &WireSettings) -> Result<bool, PluginError> {
        let mut current = self.config.load(&self.name).await?;
        if current.contains(update) {
            debug!(plugin = %self.name, "settings unchanged; not persisting");
            return Ok(false);
        }
        current.overlay(update);
        self.config.save(&self.name, &current).await?;
        info!(plugin = %self.name, "settings persisted");
        Ok(true)
    }

    /// Host-side settings edit: persist, then push to the worker with the
    /// corners on the edit topic.
    pub async fn update_ui_settings(&self, update: &WireSettings) -> Result<bool, PluginError> {
        let saved = self.save_ui_settings(update).await?;
        let typed = settings::decode_lenient(update);
        self.publisher().publish_ui_settings(&typed, CornerTarget::Edited)?;
        Ok(saved)
    }

    fn spawn_protocol_watch(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.watcher.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let mut events = self.protocol.subscribe();
        let plugin = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => debug!(?event, "protocol changed"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "protocol watch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                // A merge raises one event per step; publish once for the batch.
                while let Ok(event) = events.try_recv() {
                    if let ProtocolEvent::StepRemoved { step } = event {
                        debug!(step, "step removed");
                    }
                }
                if let Err(err) = plugin.sync.publish_snapshot().await {
                    warn!(error = %err, "failed to republish step options");
                }
            }
        });
    }
}

#[async_trait]
impl InboundHandler for DeviceUiPlugin {
    async fn on_settings_reply(&self, settings: Option<WireSettings>) {
        if let Some(settings) = settings {
            if let Err(err) = self.save_ui_settings(&settings).await {
                warn!(error = %err, "failed to save worker settings");
            }
        }
        if self.terminate_requested.load(Ordering::Acquire) {
            match self.publisher().publish_terminate() {
                Ok(()) => info!(plugin = %self.name, "worker asked to terminate"),
                Err(err) => warn!(error = %err, "failed to publish terminate"),
            }
            self.terminated.notify_one();
        }
    }

    async fn on_protocol_update(&self, edited: Vec<StepOptions>) {
        if let Err(err) = self.sync.merge_edits(&edited).await {
            warn!(error = %err, "failed to merge protocol edits");
        }
    }
}
