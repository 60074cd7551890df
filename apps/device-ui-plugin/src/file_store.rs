use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::host::{ConfigStore, StoreError};
use crate::settings::WireSettings;

/// Config store backed by one JSON file holding an object keyed by plugin
/// name. Writes go to a sibling temp file that is renamed into place.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    advanced_ui: bool,
    write_lock: Mutex<()>,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>, advanced_ui: bool) -> Self {
        Self {
            path: path.into(),
            advanced_ui,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn load(&self, plugin: &str) -> Result<WireSettings, StoreError> {
        let mut all = self.read_all().await?;
        match all.remove(plugin) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(WireSettings::with_form_defaults()),
        }
    }

    async fn save(&self, plugin: &str, settings: &WireSettings) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(plugin.to_string(), serde_json::to_value(settings)?);
        let bytes = serde_json::to_vec_pretty(&all)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), plugin, "settings written");
        Ok(())
    }

    async fn advanced_ui_enabled(&self) -> bool {
        self.advanced_ui
    }
}
