//! Bus wiring split into explicit subscriber/publisher modules for auditability.
use thiserror::Error;
use transport_bus::BusError;

pub mod subscriber {
    pub use crate::bus_ingest::{
        Bridge, INBOUND_TOPICS, InboundHandler, TOPIC_SETTINGS_REPLY, TOPIC_UPDATE_PROTOCOL,
        ingest_message,
    };
}

pub mod publisher {
    pub use crate::bus_publisher::{
        CornerTarget, OUTBOUND_TOPICS, TOPIC_DEFAULT_CORNERS, TOPIC_EDITED_CORNERS,
        TOPIC_REQUEST_SETTINGS, TOPIC_SCHEMA, TOPIC_STEP_OPTIONS, TOPIC_SURFACE_ALPHAS,
        TOPIC_TERMINATE, TOPIC_VIDEO_CONFIG, UiPublisher,
    };
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
