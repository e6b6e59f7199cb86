//! Device message — the payload shape that crosses the wire boundary.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::qos::QualityOfService;
use crate::topic::validate_topic_name;

/// A message exchanged with an external device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    /// Concrete topic name (no wildcards).
    pub topic: String,
    /// Raw bytes as sent by the device.
    pub payload: Vec<u8>,
    /// Delivery guarantee.
    #[serde(default, alias = "qos_level")]
    pub qos: QualityOfService,
}

crate::bus_message!(DeviceMessage, "device.message");

impl DeviceMessage {
    /// Build a device message.
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QualityOfService,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }

    /// Check that the topic is a valid publish topic.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for empty topics or topics with wildcards.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_topic_name(&self.topic)
    }

    /// Payload decoded as UTF-8, replacing invalid sequences. Used for logs.
    #[must_use]
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A device message published on the bus that the broker bridge forwards
/// onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDeviceMessage(pub DeviceMessage);

crate::bus_message!(OutboundDeviceMessage, "device.outbound");
