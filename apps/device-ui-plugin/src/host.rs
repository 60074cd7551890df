//! Interfaces the plugin consumes from its host application, plus in-memory
//! implementations used by the bootstrap binary and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::settings::WireSettings;

/// Option values one plugin stores on one protocol step.
pub type StepOptions = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol has no step {0}")]
    UnknownStep(usize),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Persisted settings for `plugin`, or the form defaults when nothing has
    /// been saved yet.
    async fn load(&self, plugin: &str) -> Result<WireSettings, StoreError>;
    async fn save(&self, plugin: &str, settings: &WireSettings) -> Result<(), StoreError>;
    /// Host-wide "advanced UI" flag, read when the worker starts.
    async fn advanced_ui_enabled(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    StepOptionsChanged { plugin: String, step: usize },
    StepRemoved { step: usize },
}

/// The host's ordered protocol of steps. Each step carries option documents
/// keyed by plugin identity.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    async fn step_count(&self) -> usize;
    async fn step_options(
        &self,
        step: usize,
        plugin: &str,
    ) -> Result<Option<StepOptions>, StoreError>;
    async fn set_step_options(
        &self,
        step: usize,
        plugin: &str,
        options: StepOptions,
    ) -> Result<(), StoreError>;
    fn notify_step_options_changed(&self, plugin: &str, step: usize);
    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent>;
}

#[derive(Debug)]
pub struct InMemoryConfigStore {
    values: Mutex<HashMap<String, WireSettings>>,
    advanced_ui: AtomicBool,
    saves: AtomicUsize,
}

impl InMemoryConfigStore {
    pub fn new(advanced_ui: bool) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(HashMap::new()),
            advanced_ui: AtomicBool::new(advanced_ui),
            saves: AtomicUsize::new(0),
        })
    }

    pub fn with_settings(plugin: &str, settings: WireSettings) -> Arc<Self> {
        let store = Self::new(false);
        store.values.lock().insert(plugin.to_string(), settings);
        store
    }

    pub fn set_advanced_ui(&self, enabled: bool) {
        self.advanced_ui.store(enabled, Ordering::Release);
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load(&self, plugin: &str) -> Result<WireSettings, StoreError> {
        Ok(self
            .values
            .lock()
            .get(plugin)
            .cloned()
            .unwrap_or_else(WireSettings::with_form_defaults))
    }

    async fn save(&self, plugin: &str, settings: &WireSettings) -> Result<(), StoreError> {
        self.values
            .lock()
            .insert(plugin.to_string(), settings.clone());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn advanced_ui_enabled(&self) -> bool {
        self.advanced_ui.load(Ordering::Acquire)
    }
}

/// In-memory protocol: a list of steps, each a map of plugin name to options.
#[derive(Debug)]
pub struct InMemoryProtocol {
    steps: Mutex<Vec<HashMap<String, StepOptions>>>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl Default for InMemoryProtocol {
    fn default() -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            events: broadcast::channel(256).0,
        }
    }
}

impl InMemoryProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Protocol of `count` steps that all hold `options` for `plugin`.
    pub fn with_steps(count: usize, plugin: &str, options: &StepOptions) -> Arc<Self> {
        let protocol = Self::new();
        for _ in 0..count {
            protocol.push_step(plugin, options.clone());
        }
        protocol
    }

    pub fn push_step(&self, plugin: &str, options: StepOptions) -> usize {
        let mut steps = self.steps.lock();
        steps.push(HashMap::from([(plugin.to_string(), options)]));
        steps.len() - 1
    }

    pub fn push_empty_step(&self) -> usize {
        let mut steps = self.steps.lock();
        steps.push(HashMap::new());
        steps.len() - 1
    }

    pub fn remove_step(&self, step: usize) -> Result<(), StoreError> {
        {
            let mut steps = self.steps.lock();
            if step >= steps.len() {
                return Err(StoreError::UnknownStep(step));
            }
            steps.remove(step);
        }
        let _ = self.events.send(ProtocolEvent::StepRemoved { step });
        Ok(())
    }

    pub fn options(&self, step: usize, plugin: &str) -> Option<StepOptions> {
        self.steps.lock().get(step)?.get(plugin).cloned()
    }
}

#[async_trait]
impl ProtocolStore for InMemoryProtocol {
    async fn step_count(&self) -> usize {
        self.steps.lock().len()
    }

    async fn step_options(
        &self,
        step: usize,
        plugin: &str,
    ) -> Result<Option<StepOptions>, StoreError> {
        let steps = self.steps.lock();
        let entry = steps.get(step).ok_or(StoreError::UnknownStep(step))?;
        Ok(entry.get(plugin).cloned())
    }

    async fn set_step_options(
        &self,
        step: usize,
        plugin: &str,
        options: StepOptions,
    ) -> Result<(), StoreError> {
        let mut steps = self.steps.lock();
        let entry = steps.get_mut(step).ok_or(StoreError::UnknownStep(step))?;
        entry.insert(plugin.to_string(), options);
        Ok(())
    }

    fn notify_step_options_changed(&self, plugin: &str, step: usize) {
        let _ = self.events.send(ProtocolEvent::StepOptionsChanged {
            plugin: plugin.to_string(),
            step,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}
