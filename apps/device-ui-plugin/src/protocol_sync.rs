//! Keeps the worker's per-step options array in line with the host protocol.
//!
//! The host protocol is authoritative. Snapshots are rebuilt from it on every
//! publish and never cached. Edits coming back from the worker may only
//! overwrite keys this plugin already stores on a step; anything else in the
//! edit is discarded.

use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::bus::BridgeError;
use crate::bus_publisher::UiPublisher;
use crate::host::{ProtocolStore, StepOptions, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Boolean,
    Integer,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub default: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub optional: bool,
}

/// Declared per-step option fields. Serializes as an object keyed by field
/// name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepSchema {
    fields: Vec<FieldSpec>,
}

impl StepSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// `video_enabled`: boolean, defaults to on.
    pub fn video() -> Self {
        Self::new(vec![FieldSpec {
            name: "video_enabled".into(),
            kind: FieldKind::Boolean,
            default: Value::Bool(true),
            title: Some("Video".into()),
            optional: true,
        }])
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn defaults(&self) -> StepOptions {
        self.fields
            .iter()
            .map(|field| (field.name.clone(), field.default.clone()))
            .collect()
    }
}

impl Serialize for StepSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for field in &self.fields {
            map.serialize_entry(&field.name, field)?;
        }
        map.end()
    }
}

/// Keys of `existing`, each taking the edited value when the edit has it.
pub fn overlay(existing: &StepOptions, edit: &StepOptions) -> StepOptions {
    existing
        .iter()
        .map(|(key, value)| {
            let value = edit.get(key).unwrap_or(value);
            (key.clone(), value.clone())
        })
        .collect()
}

pub struct StepSynchronizer {
    plugin: String,
    schema: StepSchema,
    protocol: Arc<dyn ProtocolStore>,
    publisher: UiPublisher,
}

impl StepSynchronizer {
    pub fn new(
        plugin: impl Into<String>,
        schema: StepSchema,
        protocol: Arc<dyn ProtocolStore>,
        publisher: UiPublisher,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            schema,
            protocol,
            publisher,
        }
    }

    pub fn schema(&self) -> &StepSchema {
        &self.schema
    }

    /// This plugin's options for every step, in step order. Steps that hold
    /// nothing for the plugin read as the schema defaults. A step removed
    /// while the snapshot is being read ends it.
    pub async fn snapshot(&self) -> Result<Vec<StepOptions>, SyncError> {
        let count = self.protocol.step_count().await;
        let mut snapshot = Vec::with_capacity(count);
        for step in 0..count {
            let options = match self.protocol.step_options(step, &self.plugin).await {
                Ok(options) => options.unwrap_or_else(|| self.schema.defaults()),
                Err(StoreError::UnknownStep(_)) => {
                    debug!(step, "protocol shrank during snapshot");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            snapshot.push(options);
        }
        Ok(snapshot)
    }

    /// Publishes the current snapshot (retained). Returns its length.
    pub async fn publish_snapshot(&self) -> Result<usize, SyncError> {
        let snapshot = self.snapshot().await?;
        self.publisher.publish_step_options(&snapshot)?;
        debug!(steps = snapshot.len(), "step options published");
        Ok(snapshot.len())
    }

    /// Publishes the schema and a single-step snapshot of its defaults, both
    /// retained.
    pub fn publish_schema(&self) -> Result<(), SyncError> {
        self.publisher.publish_schema(&self.schema)?;
        self.publisher
            .publish_step_options(&[self.schema.defaults()])?;
        Ok(())
    }

    /// Merges an edited snapshot into the protocol, strictly in step order.
    ///
    /// Indices past the current step count are skipped, as are steps holding
    /// no options for this plugin. Each written step raises a change
    /// notification before the next step is touched. Returns the number of
    /// steps written. Steps removed mid-merge end it like the end of the
    /// protocol.
    pub async fn merge_edits(&self, edited: &[StepOptions]) -> Result<usize, SyncError> {
        let count = self.protocol.step_count().await;
        if edited.len() > count {
            debug!(
                edited = edited.len(),
                steps = count,
                "ignoring edits past the end of the protocol"
            );
        }
        let mut written = 0;
        for (step, edit) in edited.iter().enumerate().take(count) {
            let existing = match self.protocol.step_options(step, &self.plugin).await {
                Ok(Some(existing)) => existing,
                Ok(None) => {
                    debug!(step, "step has no options for this plugin; skipping");
                    continue;
                }
                Err(StoreError::UnknownStep(_)) => break,
                Err(err) => return Err(err.into()),
            };
            let merged = overlay(&existing, edit);
            match self
                .protocol
                .set_step_options(step, &self.plugin, merged)
                .await
            {
                Ok(()) => {}
                Err(StoreError::UnknownStep(_)) => break,
                Err(err) => return Err(err.into()),
            }
            self.protocol
                .notify_step_options_changed(&self.plugin, step);
            written += 1;
        }
        info!(written, "protocol edits merged");
        Ok(written)
    }
}
