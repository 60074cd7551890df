use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tracing::trace;
use transport_bus::Bus;

use crate::bus::BridgeError;
use crate::host::StepOptions;
use crate::settings::TypedSettings;

pub const TOPIC_VIDEO_CONFIG: &str = "microdrop/dmf-device-ui-plugin/set-video-config";
pub const TOPIC_SURFACE_ALPHAS: &str = "microdrop/dmf-device-ui-plugin/set-surface-alphas";
pub const TOPIC_DEFAULT_CORNERS: &str = "microdrop/dmf-device-ui-plugin/set-default-corners";
pub const TOPIC_EDITED_CORNERS: &str = "microdrop/dmf-device-ui-plugin/set-corners";
pub const TOPIC_SCHEMA: &str = "microdrop/dmf-device-ui-plugin/schema";
pub const TOPIC_STEP_OPTIONS: &str = "microdrop/dmf-device-ui-plugin/step-options";
pub const TOPIC_TERMINATE: &str = "microdrop/dmf-device-ui-plugin/terminate";
pub const TOPIC_REQUEST_SETTINGS: &str = "microdrop/dmf-device-ui-plugin/get-video-settings";

pub const OUTBOUND_TOPICS: &[&str] = &[
    TOPIC_VIDEO_CONFIG,
    TOPIC_SURFACE_ALPHAS,
    TOPIC_DEFAULT_CORNERS,
    TOPIC_EDITED_CORNERS,
    TOPIC_SCHEMA,
    TOPIC_STEP_OPTIONS,
    TOPIC_TERMINATE,
    TOPIC_REQUEST_SETTINGS,
];

/// Which corner topic a settings push lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CornerTarget {
    /// Worker (re)start: corners are the worker's defaults.
    Default,
    /// Later edits made on the host side.
    Edited,
}

impl CornerTarget {
    fn topic(self) -> &'static str {
        match self {
            CornerTarget::Default => TOPIC_DEFAULT_CORNERS,
            CornerTarget::Edited => TOPIC_EDITED_CORNERS,
        }
    }
}

/// Plugin-facing publisher for the worker UI topics.
#[derive(Clone)]
pub struct UiPublisher {
    bus: Arc<dyn Bus>,
}

impl UiPublisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        retain: bool,
    ) -> Result<(), BridgeError> {
        let bytes = serde_json::to_vec(payload)?;
        trace!(topic, retain, len = bytes.len(), "publish");
        self.bus.publish(topic, Bytes::from(bytes), retain)?;
        Ok(())
    }

    /// Pushes every typed field that is present. Corners go out only as a
    /// pair.
    pub fn publish_ui_settings(
        &self,
        settings: &TypedSettings,
        corners: CornerTarget,
    ) -> Result<(), BridgeError> {
        if let Some(video_config) = &settings.video_config {
            self.publish(
                TOPIC_VIDEO_CONFIG,
                &json!({ "video_config": video_config.to_json() }),
                true,
            )?;
        }
        if let Some(surface_alphas) = &settings.surface_alphas {
            self.publish(
                TOPIC_SURFACE_ALPHAS,
                &json!({ "surface_alphas": surface_alphas.to_json() }),
                true,
            )?;
        }
        if let Some(pair) = &settings.corners {
            self.publish(
                corners.topic(),
                &json!({
                    "df_canvas_corners": pair.canvas.to_json(),
                    "df_frame_corners": pair.frame.to_json(),
                }),
                true,
            )?;
        }
        Ok(())
    }

    pub fn publish_schema<T: Serialize + ?Sized>(&self, schema: &T) -> Result<(), BridgeError> {
        self.publish(TOPIC_SCHEMA, schema, true)
    }

    pub fn publish_step_options(&self, snapshot: &[StepOptions]) -> Result<(), BridgeError> {
        self.publish(TOPIC_STEP_OPTIONS, snapshot, true)
    }

    /// Asks the worker to report its current settings.
    pub fn request_settings(&self) -> Result<(), BridgeError> {
        self.publish(TOPIC_REQUEST_SETTINGS, &(), false)
    }

    pub fn publish_terminate(&self) -> Result<(), BridgeError> {
        self.publish(TOPIC_TERMINATE, &(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{self, WireSettings};
    use transport_bus::LocalBus;

    fn typed() -> TypedSettings {
        settings::decode(&WireSettings {
            video_config: Some(String::new()),
            surface_alphas: Some(r#"{"a":1}"#.into()),
            canvas_corners: Some(",x,y\n0,1.0,2.0\n".into()),
            frame_corners: Some(",x,y\n0,3.0,4.0\n".into()),
            ..WireSettings::default()
        })
        .expect("decode")
    }

    #[tokio::test]
    async fn settings_push_is_retained_per_topic() {
        let bus = Arc::new(LocalBus::new());
        let publisher = UiPublisher::new(bus.clone());
        publisher
            .publish_ui_settings(&typed(), CornerTarget::Default)
            .expect("publish ok");

        let video = bus.retained(TOPIC_VIDEO_CONFIG).expect("video retained");
        let value: serde_json::Value = serde_json::from_slice(&video.payload).unwrap();
        assert_eq!(value["video_config"], "{}");

        let alphas = bus.retained(TOPIC_SURFACE_ALPHAS).expect("alphas retained");
        let value: serde_json::Value = serde_json::from_slice(&alphas.payload).unwrap();
        assert_eq!(value["surface_alphas"], r#"{"a":1}"#);

        let corners = bus.retained(TOPIC_DEFAULT_CORNERS).expect("corners retained");
        let value: serde_json::Value = serde_json::from_slice(&corners.payload).unwrap();
        let frame: serde_json::Value =
            serde_json::from_str(value["df_frame_corners"].as_str().unwrap()).unwrap();
        assert_eq!(frame["0"]["y"], 4.0);
        assert!(bus.retained(TOPIC_EDITED_CORNERS).is_none());
    }

    #[tokio::test]
    async fn edited_corners_use_their_own_topic() {
        let bus = Arc::new(LocalBus::new());
        let publisher = UiPublisher::new(bus.clone());
        publisher
            .publish_ui_settings(&typed(), CornerTarget::Edited)
            .expect("publish ok");
        assert!(bus.retained(TOPIC_EDITED_CORNERS).is_some());
        assert!(bus.retained(TOPIC_DEFAULT_CORNERS).is_none());
    }

    #[tokio::test]
    async fn absent_fields_are_not_published() {
        let bus = Arc::new(LocalBus::new());
        let publisher = UiPublisher::new(bus.clone());
        publisher
            .publish_ui_settings(&TypedSettings::default(), CornerTarget::Default)
            .expect("publish ok");
        for topic in [TOPIC_VIDEO_CONFIG, TOPIC_SURFACE_ALPHAS, TOPIC_DEFAULT_CORNERS] {
            assert!(bus.retained(topic).is_none(), "{topic} should be empty");
        }
    }

    #[tokio::test]
    async fn terminate_is_not_retained() {
        let bus = Arc::new(LocalBus::new());
        let mut sub = bus.subscribe(TOPIC_TERMINATE);
        let publisher = UiPublisher::new(bus.clone());
        publisher.publish_terminate().expect("publish ok");
        let msg = sub.recv().await.expect("recv");
        assert_eq!(msg.payload.as_ref(), b"null");
        assert!(!msg.retained);
        assert!(bus.retained(TOPIC_TERMINATE).is_none());
    }
}
